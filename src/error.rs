//! Error taxonomy for directory operations.

use url::Url;

/// The kind of directory operation that produced an error or log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
	/// Establishing the transport connection.
	Connect,
	/// Authenticating against the server.
	Bind,
	/// A search request.
	Search,
	/// An attribute modification.
	Modify,
	/// A rename (modify DN).
	Rename,
	/// An entry addition.
	Create,
	/// An entry deletion.
	Delete,
}

impl std::fmt::Display for OperationKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			OperationKind::Connect => "connect",
			OperationKind::Bind => "bind",
			OperationKind::Search => "search",
			OperationKind::Modify => "modify",
			OperationKind::Rename => "rename",
			OperationKind::Create => "create",
			OperationKind::Delete => "delete",
		};
		f.write_str(name)
	}
}

/// The bootstrap stage that failed when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
	/// Could not establish the transport connection.
	Connect,
	/// Connected, but authentication failed.
	Bind,
	/// Bound, but the root metadata entry could not be read.
	RootDse,
	/// Root metadata was read, but no usable base DN could be determined.
	BaseDns,
}

impl std::fmt::Display for BootstrapStage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			BootstrapStage::Connect => "connect",
			BootstrapStage::Bind => "bind",
			BootstrapStage::RootDse => "root metadata",
			BootstrapStage::BaseDns => "base DN discovery",
		};
		f.write_str(name)
	}
}

/// Errors that can occur when using this library.
///
/// Expected control-flow conditions (cancellation, referrals) are modeled as
/// explicit variants rather than being folded into a generic failure, so
/// callers can match on them without string inspection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The transport connection could not be established. Covers host
	/// resolution, TCP and TLS negotiation failures.
	#[error("could not connect to {url}: {reason}")]
	Connect {
		/// The server URL the connection was attempted against.
		url: String,
		/// Human readable failure description from the transport.
		reason: String,
	},
	/// Authentication was rejected or the mechanism is unsupported.
	#[error("bind failed for {principal:?}: {reason}")]
	Bind {
		/// The bind principal, empty for anonymous binds.
		principal: String,
		/// Human readable failure description.
		reason: String,
	},
	/// A network-level failure that is eligible for the one-shot
	/// reconnect-and-retry policy: dropped connection, service unavailable
	/// or server resource exhaustion.
	#[error("transient network failure during {op}: {reason}")]
	Transient {
		/// The operation that was in flight.
		op: OperationKind,
		/// Human readable failure description.
		reason: String,
	},
	/// A protocol-level failure reported by the server. Never retried.
	#[error("{op} on {dn:?} failed with result code {code}: {text}")]
	Protocol {
		/// The failed operation.
		op: OperationKind,
		/// The target DN of the operation, empty for the root DSE.
		dn: String,
		/// The LDAP result code.
		code: u32,
		/// The diagnostic message from the server.
		text: String,
	},
	/// The operation was aborted on request of the caller. The session is
	/// disconnected afterwards and reconnects lazily on the next call.
	#[error("operation cancelled")]
	Cancelled,
	/// The directory did not publish a schema location, or the schema
	/// search returned no result. The session stays usable with the
	/// fallback schema.
	#[error("schema unavailable: {0}")]
	SchemaUnavailable(String),
	/// The server redirected the operation elsewhere. Not an error proper;
	/// surfaced only when the referral handling mode asks for it, carrying
	/// the redirect targets for the caller to resolve.
	#[error("referral encountered for {dn:?}")]
	Referral {
		/// The DN the referral was returned for.
		dn: String,
		/// The redirect targets.
		urls: Vec<Url>,
	},
	/// A distinguished name string could not be parsed.
	#[error("invalid distinguished name {0:?}")]
	InvalidDn(String),
	/// A connection parameter is unusable (e.g. unreadable certificate
	/// material).
	#[error("invalid configuration: {0}")]
	Config(String),
	/// An I/O failure outside the transport, e.g. while reading certificate
	/// files or writing export records.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// A bootstrap stage failed while opening a session.
	#[error("session open failed during {stage}")]
	Bootstrap {
		/// The stage that failed.
		stage: BootstrapStage,
		/// The underlying failure.
		#[source]
		source: Box<Error>,
	},
}

impl Error {
	/// Whether this failure belongs to the transient network class that the
	/// session answers with a single reconnect-and-retry.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::Transient { .. })
	}

	/// The LDAP result code carried by this error, if any.
	#[must_use]
	pub fn result_code(&self) -> Option<u32> {
		match self {
			Error::Protocol { code, .. } => Some(*code),
			_ => None,
		}
	}

	/// Wraps this error with the bootstrap stage it occurred in. Connect and
	/// bind failures keep their own stage regardless of the caller's guess.
	#[must_use]
	pub fn at_stage(self, stage: BootstrapStage) -> Self {
		let stage = match &self {
			Error::Connect { .. } => BootstrapStage::Connect,
			Error::Bind { .. } => BootstrapStage::Bind,
			_ => stage,
		};
		Error::Bootstrap { stage, source: Box::new(self) }
	}
}
