//! Connection parameters for a directory session.
//!
//! These structs are the only state the engine needs to persist across
//! restarts; caches and schema snapshots are ephemeral and rebuilt on open.

use std::{path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Configuration for which variant of ISO8601 to use for parsing and
/// serializing time. Configured according the syntax definition
/// `( 1.3.6.1.4.1.1466.115.121.1.24 DESC 'Generalized Time' )` described in
/// RFC4517 section 3.1.13
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// Alias dereferencing policy for searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasDereferencing {
	/// Never dereference aliases.
	Never,
	/// Dereference while searching subordinates, not the base object.
	Searching,
	/// Dereference when finding the base object, not subordinates.
	Finding,
	/// Always dereference.
	Always,
}

/// How the engine reacts to referral results. Referrals are never followed
/// automatically; the caller resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralHandling {
	/// Drop referral results silently.
	Ignore,
	/// Surface referral results to the caller for resolution.
	Surface,
}

/// Connection parameters of one directory session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// The URL to connect to the server with. Supports ldap and ldaps
	/// schemes.
	pub url: Url,
	/// The principal to bind as. Empty for anonymous binds. The secret is
	/// supplied by the credential collaborator, never stored here.
	pub bind_principal: String,
	/// The base DN to browse. `None` derives the base DNs from the root
	/// metadata's naming contexts.
	pub base_dn: Option<String>,
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,
	/// LDAP operation timeout. For search per reply.
	pub operation_timeout: Duration,
	/// Maximum number of entries a search may return. Zero means no
	/// client-requested limit.
	pub size_limit: i32,
	/// Maximum number of seconds a search may run. Zero means no
	/// client-requested limit.
	pub time_limit: i32,
	/// If set, enables the simple paged results control with this page size
	/// for searches.
	#[serde(default)]
	pub page_size: Option<i32>,
	/// Default alias dereferencing policy.
	pub aliases: AliasDereferencing,
	/// Default referral handling policy.
	pub referrals: ReferralHandling,
	/// TLS config.
	pub tls: TlsConfig,
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,
	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,
	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,
	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,
	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

impl ConnectionConfig {
	/// A config with defaults suitable for an unauthenticated local
	/// connection; used as a starting point by tests and examples.
	pub fn new(url: Url) -> Self {
		ConnectionConfig {
			url,
			bind_principal: String::new(),
			base_dn: None,
			timeout: 10,
			operation_timeout: Duration::from_secs(30),
			size_limit: 0,
			time_limit: 0,
			page_size: None,
			aliases: AliasDereferencing::Never,
			referrals: ReferralHandling::Surface,
			tls: TlsConfig::default(),
		}
	}

	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`].
	/// TLS negotiation driven by these settings completes during connect,
	/// before the session reports itself connected.
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = rustls::RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			for der in rustls_pemfile::certs(&mut pem.as_slice())? {
				roots.add(&rustls::Certificate(der)).map_err(|_| {
					Error::Config("could not read root certificate".to_owned())
				})?;
			}

			let builder = rustls::ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(roots);
			let client_config = match (&self.tls.client_key_path, &self.tls.client_certificate_path)
			{
				(Some(key_path), Some(cert_path)) => {
					let certs = rustls_pemfile::certs(
						&mut tokio::fs::read(cert_path).await?.as_slice(),
					)?
					.into_iter()
					.map(rustls::Certificate)
					.collect();
					let key = rustls_pemfile::pkcs8_private_keys(
						&mut tokio::fs::read(key_path).await?.as_slice(),
					)?
					.into_iter()
					.next()
					.map(rustls::PrivateKey)
					.ok_or_else(|| {
						Error::Config("no PKCS8 key found in client key file".to_owned())
					})?;
					builder.with_client_auth_cert(certs, key).map_err(|_| {
						Error::Config("could not read client certificates".to_owned())
					})?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => {
					return Err(Error::Config(
						"both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))
				}
			};
			settings = settings.set_config(Arc::new(client_config));
		}
		Ok(settings)
	}
}

/// A known server software family. Behavioral deltas between families are
/// described by one [`ServerDialect`] row each, selected once at bootstrap,
/// instead of a class per server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectKind {
	/// Any standards-following server without recognized vendor metadata.
	Generic,
	/// OpenLDAP (slapd).
	OpenLdap,
	/// Apache Directory Server.
	ApacheDs,
	/// Microsoft Active Directory.
	ActiveDirectory,
}

/// The behavioral deltas of one server family that the engine consumes.
#[derive(Debug, Clone, Copy)]
pub struct ServerDialect {
	/// The family this row describes.
	pub kind: DialectKind,
	/// Where to look for the schema subentry when the root metadata does
	/// not publish a location.
	pub schema_dn_fallback: &'static str,
	/// The operational attribute holding an entry's modification time.
	pub modify_timestamp_attribute: &'static str,
	/// The operational attribute holding an entry's creation time.
	pub create_timestamp_attribute: &'static str,
	/// Whether the simple paged results control can be assumed available.
	pub supports_paging: bool,
}

/// The capability table, one row per known family.
static DIALECTS: &[ServerDialect] = &[
	ServerDialect {
		kind: DialectKind::Generic,
		schema_dn_fallback: "cn=schema",
		modify_timestamp_attribute: "modifyTimestamp",
		create_timestamp_attribute: "createTimestamp",
		supports_paging: false,
	},
	ServerDialect {
		kind: DialectKind::OpenLdap,
		schema_dn_fallback: "cn=Subschema",
		modify_timestamp_attribute: "modifyTimestamp",
		create_timestamp_attribute: "createTimestamp",
		supports_paging: true,
	},
	ServerDialect {
		kind: DialectKind::ApacheDs,
		schema_dn_fallback: "cn=schema",
		modify_timestamp_attribute: "modifyTimestamp",
		create_timestamp_attribute: "createTimestamp",
		supports_paging: true,
	},
	ServerDialect {
		kind: DialectKind::ActiveDirectory,
		schema_dn_fallback: "cn=schema",
		modify_timestamp_attribute: "whenChanged",
		create_timestamp_attribute: "whenCreated",
		supports_paging: true,
	},
];

impl ServerDialect {
	/// The row for a family.
	#[must_use]
	pub fn for_kind(kind: DialectKind) -> &'static ServerDialect {
		DIALECTS.iter().find(|d| d.kind == kind).unwrap_or(&DIALECTS[0])
	}

	/// Selects the dialect from the root metadata's vendor attributes.
	/// Unrecognized or absent vendor data selects the generic row.
	#[must_use]
	pub fn detect(vendor_name: Option<&str>, vendor_version: Option<&str>) -> &'static ServerDialect {
		let haystack =
			format!("{} {}", vendor_name.unwrap_or(""), vendor_version.unwrap_or("")).to_lowercase();
		let kind = if haystack.contains("apache") {
			DialectKind::ApacheDs
		} else if haystack.contains("microsoft") || haystack.contains("active directory") {
			DialectKind::ActiveDirectory
		} else if haystack.contains("openldap") {
			DialectKind::OpenLdap
		} else {
			DialectKind::Generic
		};
		ServerDialect::for_kind(kind)
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used, clippy::expect_used)]

	use std::{io::ErrorKind, path::PathBuf};

	use time::PrimitiveDateTime;
	use url::Url;

	use super::{ConnectionConfig, DialectKind, ServerDialect, TlsConfig, TIME_FORMAT};
	use crate::error::Error;

	#[test]
	fn test_time_config() -> Result<(), Box<dyn std::error::Error>> {
		PrimitiveDateTime::parse("20130516200520Z", &TIME_FORMAT)?;

		Ok(())
	}

	#[test]
	fn dialect_detection() {
		assert_eq!(
			ServerDialect::detect(Some("Apache Software Foundation"), Some("2.0")).kind,
			DialectKind::ApacheDs
		);
		assert_eq!(
			ServerDialect::detect(None, None).kind,
			DialectKind::Generic,
			"missing vendor data selects the generic row"
		);
		assert_eq!(
			ServerDialect::detect(Some("OpenLDAP foundation"), None).schema_dn_fallback,
			"cn=Subschema"
		);
	}

	#[tokio::test]
	async fn tls_config_with_missing_files_reports_io_error() {
		let mut config = ConnectionConfig::new(Url::parse("ldap://localhost").unwrap());
		config.tls = TlsConfig {
			root_certificates_path: Some(PathBuf::from("does/not/exist")),
			..TlsConfig::default()
		};

		match config.to_settings().await {
			Err(Error::Io(err)) => assert_eq!(err.kind(), ErrorKind::NotFound),
			_other => panic!("expected an I/O error, got a different result"),
		}
	}

	#[tokio::test]
	async fn tls_config_requires_matching_client_material() {
		let mut config = ConnectionConfig::new(Url::parse("ldap://localhost").unwrap());
		config.tls = TlsConfig {
			root_certificates_path: Some(PathBuf::from("Cargo.toml")),
			client_key_path: Some(PathBuf::from("only-a-key")),
			..TlsConfig::default()
		};

		assert!(matches!(config.to_settings().await, Err(Error::Config(_) | Error::Io(_))));
	}
}
