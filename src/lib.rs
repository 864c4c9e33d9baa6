//! Browse and manipulate a remote LDAP directory through a client-side
//! session and entry cache.
//!
//! The library owns a live connection to a directory server, keeps a
//! per-session cache of fetched entries (attributes and children, keyed by
//! distinguished name), executes search and modify operations with
//! cancellation and a one-shot reconnect on transient failures, and tracks
//! the server's schema with lazy revalidation. It is the engine a browsing
//! UI calls into; widgets, editors and credential prompts stay outside.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for the wire protocol is an excellent resource. The
//! site "firstyear's blog-a-log" also has [a guide][firstyear] which is
//! more visually oriented and goes into more detail about searching
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//! [firstyear]: https://fy.blackhats.net.au/blog/html/pages/ldap_guide_part_1_foundations.html
//!
//! # Getting started
//! A minimal browsing session might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use ldap_browser::{
//!     browser::Browser,
//!     config::ConnectionConfig,
//!     credentials::StoredCredentials,
//!     transport::Ldap3Provider,
//! };
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! // Configuration can also be deserialized with serde. It's
//! // hand-constructed here for demonstration purposes.
//! let mut config = ConnectionConfig::new(Url::parse("ldap://localhost")?);
//! config.bind_principal = "cn=admin,dc=example,dc=com".to_owned();
//!
//! let browser = Browser::new(
//!     config,
//!     Arc::new(Ldap3Provider),
//!     Arc::new(StoredCredentials::new("cn=admin,dc=example,dc=com", "verysecret")),
//! );
//!
//! let cancel = CancellationToken::new();
//! let report = browser.open(&cancel).await?;
//! println!("base DNs: {:?}", report.base_dns);
//!
//! for base in &report.base_dns {
//!     for child in browser.load_children(base, &cancel).await? {
//!         println!("{} (children: {})", child.dn(), child.flags().has_children_hint());
//!     }
//! }
//!
//! browser.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * One session serializes its operations on a single transport; callers
//!   wanting parallel searches open independent sessions.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing bind
//!   secrets, it probably should be
//! * SASL mechanisms beyond simple binds are not implemented.

pub mod browser;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod dn;
pub mod entry;
pub mod error;
pub mod ldif;
pub mod modlog;
pub mod provider;
pub mod schema;
pub mod search;
pub mod session;
pub mod transport;

pub use ldap3;

pub use crate::{
	browser::{BootstrapReport, Browser},
	cache::{ChildrenSet, EntryCache},
	config::{AliasDereferencing, ConnectionConfig, ReferralHandling, ServerDialect, TlsConfig},
	credentials::{Credentials, StoredCredentials},
	dn::{Dn, Rdn},
	entry::{Attribute, AttributeSet, AttributeValue, Entry},
	error::{BootstrapStage, Error, OperationKind},
	provider::{DirectoryProvider, EntryRecord, ModifyOp, ProviderHandle, RecordCursor, SearchRecord},
	schema::{Schema, SchemaCache},
	search::{RecordStream, SearchRequest, SearchScope},
	session::{Session, SessionState},
	transport::Ldap3Provider,
};
