//! A scripted in-memory directory provider for exercising the engine
//! without a server: canned entries, per-call failure scripts and call
//! counters.

use std::{
	collections::{BTreeMap, HashMap, VecDeque},
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use ldap_browser::{
	config::ConnectionConfig,
	credentials::Credentials,
	dn::{Dn, Rdn},
	entry::AttributeValue,
	error::{Error, OperationKind},
	provider::{
		DirectoryProvider, EntryRecord, ModifyOp, ProviderHandle, RecordCursor, SearchRecord,
		SearchSummary,
	},
	search::{SearchRequest, SearchScope},
};

/// Textual attributes of one stub entry.
pub type Attrs = HashMap<String, Vec<String>>;

/// A scripted failure popped by the next matching call.
#[derive(Debug, Clone, Copy)]
pub enum Fail {
	/// A transient network failure (eligible for the retry policy).
	Transient,
	/// A rejected bind.
	BadCredentials,
	/// A refused connection.
	ConnectRefused,
}

/// Shared state behind every handle the stub hands out.
#[derive(Debug, Default)]
pub struct StubState {
	/// Entries by DN string, insertion-ordered for deterministic listings.
	pub entries: BTreeMap<String, Attrs>,
	/// Failures popped by `connect` calls.
	pub connect_failures: VecDeque<Fail>,
	/// Failures popped by `bind` calls.
	pub bind_failures: VecDeque<Fail>,
	/// Failures popped by `search` calls.
	pub search_failures: VecDeque<Fail>,
	/// Failures popped by write calls.
	pub write_failures: VecDeque<Fail>,
	/// When set, `search` blocks until the caller cancels.
	pub hang_searches: bool,
	/// Number of `connect` calls.
	pub connects: usize,
	/// Number of `bind` calls.
	pub binds: usize,
	/// Number of `search` calls.
	pub searches: usize,
	/// Number of `close` calls.
	pub closes: usize,
}

/// The scripted provider. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct StubDirectory {
	/// The shared state.
	state: Arc<Mutex<StubState>>,
}

impl StubDirectory {
	pub fn new() -> Self {
		StubDirectory::default()
	}

	/// A stub populated with the example tree: a root DSE advertising
	/// `dc=example,dc=com` and `cn=schema`, a small people subtree and a
	/// parsable subschema entry.
	pub fn with_example_tree() -> Self {
		let stub = StubDirectory::new();
		stub.put_entry(
			"",
			&[
				("objectClass", &["top"]),
				("namingContexts", &["dc=example,dc=com"]),
				("subschemaSubentry", &["cn=schema"]),
				("vendorName", &["Example Directory"]),
				("supportedLDAPVersion", &["3"]),
			],
		);
		stub.put_entry(
			"dc=example,dc=com",
			&[
				("objectClass", &["top", "domain"]),
				("dc", &["example"]),
				("hasSubordinates", &["TRUE"]),
			],
		);
		stub.put_entry(
			"ou=people,dc=example,dc=com",
			&[
				("objectClass", &["top", "organizationalUnit"]),
				("ou", &["people"]),
				("hasSubordinates", &["TRUE"]),
			],
		);
		stub.put_entry(
			"cn=alice,ou=people,dc=example,dc=com",
			&[
				("objectClass", &["top", "inetOrgPerson"]),
				("cn", &["alice"]),
				("sn", &["Aman"]),
				("hasSubordinates", &["FALSE"]),
			],
		);
		stub.put_entry(
			"cn=bob,ou=people,dc=example,dc=com",
			&[
				("objectClass", &["top", "inetOrgPerson"]),
				("cn", &["bob"]),
				("sn", &["Baker"]),
				("hasSubordinates", &["FALSE"]),
			],
		);
		stub.put_entry(
			"cn=schema",
			&[
				("objectClass", &["top", "subentry", "subschema"]),
				("modifyTimestamp", &["20240301120000Z"]),
				(
					"objectClasses",
					&["( 2.5.6.6 NAME 'person' SUP top STRUCTURAL MUST ( sn $ cn ) )"],
				),
				(
					"attributeTypes",
					&[
						"( 2.5.4.3 NAME ( 'cn' 'commonName' ) EQUALITY caseIgnoreMatch \
						 SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
						"( 2.5.4.4 NAME 'sn' SUP name \
						 SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
					],
				),
			],
		);
		stub
	}

	/// Inserts or replaces an entry.
	pub fn put_entry(&self, dn: &str, attrs: &[(&str, &[&str])]) {
		let attrs: Attrs = attrs
			.iter()
			.map(|(k, vs)| ((*k).to_owned(), vs.iter().map(|v| (*v).to_owned()).collect()))
			.collect();
		self.state.lock().unwrap().entries.insert(dn.to_owned(), attrs);
	}

	/// Whether an entry exists.
	pub fn has_entry(&self, dn: &str) -> bool {
		self.state.lock().unwrap().entries.contains_key(dn)
	}

	/// Overwrites the subschema entry's modification timestamp.
	pub fn set_schema_timestamp(&self, timestamp: &str) {
		let mut state = self.state.lock().unwrap();
		if let Some(attrs) = state.entries.get_mut("cn=schema") {
			attrs.insert("modifyTimestamp".to_owned(), vec![timestamp.to_owned()]);
		}
	}

	/// Scripts a failure for an upcoming call.
	pub fn script(&self, op: OperationKind, failure: Fail) {
		let mut state = self.state.lock().unwrap();
		match op {
			OperationKind::Connect => state.connect_failures.push_back(failure),
			OperationKind::Bind => state.bind_failures.push_back(failure),
			OperationKind::Search => state.search_failures.push_back(failure),
			_ => state.write_failures.push_back(failure),
		}
	}

	/// Makes subsequent searches block until cancelled.
	pub fn set_hang_searches(&self, hang: bool) {
		self.state.lock().unwrap().hang_searches = hang;
	}

	pub fn connects(&self) -> usize {
		self.state.lock().unwrap().connects
	}

	pub fn binds(&self) -> usize {
		self.state.lock().unwrap().binds
	}

	pub fn searches(&self) -> usize {
		self.state.lock().unwrap().searches
	}
}

/// Builds the error a scripted failure stands for.
fn failure_error(failure: Fail, op: OperationKind) -> Error {
	match failure {
		Fail::Transient => Error::Transient { op, reason: "scripted outage".to_owned() },
		Fail::BadCredentials => Error::Bind {
			principal: "scripted".to_owned(),
			reason: "invalid credentials".to_owned(),
		},
		Fail::ConnectRefused => Error::Connect {
			url: "stub://".to_owned(),
			reason: "connection refused".to_owned(),
		},
	}
}

#[async_trait]
impl DirectoryProvider for StubDirectory {
	async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn ProviderHandle>, Error> {
		let mut state = self.state.lock().unwrap();
		state.connects += 1;
		if let Some(failure) = state.connect_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Connect));
		}
		Ok(Box::new(StubHandle { state: Arc::clone(&self.state) }))
	}
}

/// One stub connection.
#[derive(Debug)]
pub struct StubHandle {
	/// The provider's shared state.
	state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl ProviderHandle for StubHandle {
	async fn bind(&mut self, _credentials: &Credentials) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		state.binds += 1;
		if let Some(failure) = state.bind_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Bind));
		}
		Ok(())
	}

	async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn RecordCursor>, Error> {
		let (hang, scripted) = {
			let mut state = self.state.lock().unwrap();
			state.searches += 1;
			(state.hang_searches, state.search_failures.pop_front())
		};
		if let Some(failure) = scripted {
			return Err(failure_error(failure, OperationKind::Search));
		}
		if hang {
			// parked until the caller cancels and drops this future
			tokio::time::sleep(Duration::from_secs(3600)).await;
		}

		let base = request.base.to_string();
		let state = self.state.lock().unwrap();
		let records: VecDeque<SearchRecord> = state
			.entries
			.iter()
			.filter(|(dn, _)| in_scope(dn, &base, request.scope))
			.filter(|(_, attrs)| matches_filter(attrs, &request.filter))
			.map(|(dn, attrs)| {
				SearchRecord::Entry(EntryRecord {
					dn: dn.clone(),
					attrs: attrs.clone(),
					bin_attrs: HashMap::new(),
				})
			})
			.collect();
		Ok(Box::new(StubCursor { records, summary: None }))
	}

	async fn add(
		&mut self,
		dn: &Dn,
		attributes: &[(String, Vec<AttributeValue>)],
	) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		if let Some(failure) = state.write_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Create));
		}
		let attrs: Attrs = attributes
			.iter()
			.map(|(name, values)| {
				(
					name.clone(),
					values
						.iter()
						.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
						.collect(),
				)
			})
			.collect();
		state.entries.insert(dn.to_string(), attrs);
		Ok(())
	}

	async fn modify(&mut self, dn: &Dn, changes: &[ModifyOp]) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		if let Some(failure) = state.write_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Modify));
		}
		let target = dn.to_string();
		let Some(attrs) = state.entries.get_mut(&target) else {
			return Err(Error::Protocol {
				op: OperationKind::Modify,
				dn: target,
				code: 32,
				text: "no such object".to_owned(),
			});
		};
		for change in changes {
			match change {
				ModifyOp::Add(attr, values) => {
					attrs
						.entry(attr.clone())
						.or_default()
						.extend(values.iter().map(|v| {
							String::from_utf8_lossy(v.as_bytes()).into_owned()
						}));
				}
				ModifyOp::Delete(attr, _) => {
					attrs.remove(attr);
				}
				ModifyOp::Replace(attr, values) => {
					attrs.insert(
						attr.clone(),
						values
							.iter()
							.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
							.collect(),
					);
				}
			}
		}
		Ok(())
	}

	async fn rename(&mut self, dn: &Dn, new_rdn: &Rdn, _delete_old_rdn: bool) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		if let Some(failure) = state.write_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Rename));
		}
		let old = dn.to_string();
		let Some(attrs) = state.entries.remove(&old) else {
			return Err(Error::Protocol {
				op: OperationKind::Rename,
				dn: old,
				code: 32,
				text: "no such object".to_owned(),
			});
		};
		let new_dn = match dn.parent() {
			Some(parent) if !parent.is_root() => format!("{new_rdn},{parent}"),
			_ => new_rdn.to_string(),
		};
		state.entries.insert(new_dn, attrs);
		Ok(())
	}

	async fn delete(&mut self, dn: &Dn) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		if let Some(failure) = state.write_failures.pop_front() {
			return Err(failure_error(failure, OperationKind::Delete));
		}
		let target = dn.to_string();
		if state.entries.remove(&target).is_none() {
			return Err(Error::Protocol {
				op: OperationKind::Delete,
				dn: target,
				code: 32,
				text: "no such object".to_owned(),
			});
		}
		Ok(())
	}

	async fn close(&mut self) -> Result<(), Error> {
		self.state.lock().unwrap().closes += 1;
		Ok(())
	}
}

/// A pre-computed result cursor.
#[derive(Debug)]
pub struct StubCursor {
	/// Remaining records.
	records: VecDeque<SearchRecord>,
	/// Set once exhausted.
	summary: Option<SearchSummary>,
}

#[async_trait]
impl RecordCursor for StubCursor {
	async fn next_record(&mut self) -> Result<Option<SearchRecord>, Error> {
		match self.records.pop_front() {
			Some(record) => Ok(Some(record)),
			None => {
				self.summary = Some(SearchSummary::default());
				Ok(None)
			}
		}
	}

	fn summary(&self) -> Option<SearchSummary> {
		self.summary
	}
}

/// Scope matching over DN strings. Test data uses no escaped commas.
fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
	match scope {
		SearchScope::Object => dn.eq_ignore_ascii_case(base),
		SearchScope::OneLevel => {
			let parent = dn.split_once(',').map_or("", |(_, p)| p);
			!dn.is_empty() && parent.eq_ignore_ascii_case(base) && !dn.eq_ignore_ascii_case(base)
		}
		SearchScope::Subtree => {
			dn.eq_ignore_ascii_case(base)
				|| (base.is_empty() && !dn.is_empty())
				|| dn.to_lowercase().ends_with(&format!(",{}", base.to_lowercase()))
		}
	}
}

/// Minimal filter evaluation: `(objectClass=*)`, presence and single
/// equality filters.
fn matches_filter(attrs: &Attrs, filter: &str) -> bool {
	let Some(inner) = filter.strip_prefix('(').and_then(|f| f.strip_suffix(')')) else {
		return true;
	};
	let Some((attr, value)) = inner.split_once('=') else {
		return true;
	};
	if value == "*" {
		return attrs.keys().any(|k| k.eq_ignore_ascii_case(attr));
	}
	attrs
		.iter()
		.any(|(k, vs)| k.eq_ignore_ascii_case(attr) && vs.iter().any(|v| v.eq_ignore_ascii_case(value)))
}
