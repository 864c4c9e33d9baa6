//! The credential collaborator supplying bind secrets on demand.
//!
//! The session calls the source exactly once per bind attempt and never
//! stores the returned secret beyond the bind call, so interactive sources
//! (a prompt dialog, an agent) see every authentication attempt.

use async_trait::async_trait;

use crate::error::Error;

/// Bind credentials for one authentication attempt. An empty principal and
/// secret perform an anonymous bind.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
	/// The bind DN or SASL identity.
	pub principal: String,
	/// The bind secret.
	pub secret: String,
}

/// Supplies bind credentials on demand.
#[async_trait]
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
	/// Produces credentials for one bind attempt. Called once per attempt,
	/// including the rebind of a reconnect-and-retry cycle.
	async fn credentials(&self) -> Result<Credentials, Error>;
}

/// A source returning the same remembered credentials on every attempt.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
	/// The remembered credentials.
	credentials: Credentials,
}

impl StoredCredentials {
	/// Remembers a principal and secret.
	pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
		StoredCredentials {
			credentials: Credentials { principal: principal.into(), secret: secret.into() },
		}
	}
}

#[async_trait]
impl CredentialSource for StoredCredentials {
	async fn credentials(&self) -> Result<Credentials, Error> {
		Ok(self.credentials.clone())
	}
}

/// A source performing anonymous binds only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
	async fn credentials(&self) -> Result<Credentials, Error> {
		Ok(Credentials::default())
	}
}
