//! The `ldap3`-backed implementation of the provider traits.
//!
//! This is the one place that talks the wire protocol: URL and settings
//! assembly, the connection driver task, result-code mapping into the error
//! taxonomy, and the pump task that feeds streaming search results through
//! a bounded channel so no more than a sliver of a page sits in memory.

use std::collections::HashSet;

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	controls::RawControl,
	DerefAliases, LdapConnAsync, LdapError, LdapResult, Mod, Scope,
	SearchEntry, SearchOptions,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};
use url::Url;

use crate::{
	config::{AliasDereferencing, ConnectionConfig},
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

/// The manage-DSA-IT control (RFC 3296): return referral entries as plain
/// entries.
const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// The subentries control (RFC 3672). The value is the BER encoding of
/// BOOLEAN TRUE.
const SUBENTRIES_OID: &str = "1.3.6.1.4.1.4203.1.10.1";

/// Capacity of the channel between the pump task and the cursor. Kept
/// below a typical page size; the consumer's pace, not buffering, bounds
/// what sits in memory.
const RECORD_BUFFER: usize = 32;

/// The shipped [`DirectoryProvider`]: one `ldap3` connection per handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Provider;

#[async_trait]
impl DirectoryProvider for Ldap3Provider {
	async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn ProviderHandle>, Error> {
		let settings = config.to_settings().await?;
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, &config.url)
			.await
			.map_err(|err| Error::Connect {
				url: config.url.to_string(),
				reason: err.to_string(),
			})?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});
		debug!("connected to {}", config.url);
		Ok(Box::new(Ldap3Handle { ldap, driver }))
	}
}

/// One live `ldap3` connection.
pub struct Ldap3Handle {
	/// The operation handle; clones share the underlying connection.
	ldap: ldap3::Ldap,
	/// The connection driver task.
	driver: JoinHandle<()>,
}

impl std::fmt::Debug for Ldap3Handle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Ldap3Handle").finish_non_exhaustive()
	}
}

#[async_trait]
impl ProviderHandle for Ldap3Handle {
	async fn bind(&mut self, credentials: &Credentials) -> Result<(), Error> {
		let result = self
			.ldap
			.simple_bind(&credentials.principal, &credentials.secret)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Bind, "", err))?;
		match result.rc {
			0 => Ok(()),
			// invalidCredentials and inappropriateAuthentication
			49 | 48 => Err(Error::Bind {
				principal: credentials.principal.clone(),
				reason: result.text,
			}),
			_ => Err(map_result(OperationKind::Bind, "", result)),
		}
	}

	async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn RecordCursor>, Error> {
		let mut adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
		if let Some(page_size) = request.page_size {
			adapters.push(Box::new(PagedResults::new(page_size)));
		}

		let mut ldap = self.ldap.clone();
		ldap.with_search_options(
			SearchOptions::new()
				.sizelimit(request.size_limit)
				.timelimit(request.time_limit)
				.deref(deref_mode(request.aliases)),
		);
		let mut controls: Vec<RawControl> = Vec::new();
		if request.manage_dsa_it {
			controls.push(RawControl {
				ctype: MANAGE_DSA_IT_OID.to_owned(),
				crit: true,
				val: None,
			});
		}
		if request.subentries {
			controls.push(RawControl {
				ctype: SUBENTRIES_OID.to_owned(),
				crit: false,
				val: Some(vec![0x01, 0x01, 0xff]),
			});
		}
		if !controls.is_empty() {
			ldap.with_controls(controls);
		}

		let base = request.base.to_string();
		let mut stream = ldap
			.streaming_search_with(
				adapters,
				&base,
				search_scope(request.scope),
				&request.filter,
				request.attributes.clone(),
			)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Search, &base, err))?;

		let (sender, receiver) = mpsc::channel(RECORD_BUFFER);
		let task = tokio::spawn(async move {
			loop {
				match stream.next().await {
					Ok(Some(result_entry)) => {
						let entry = SearchEntry::construct(result_entry);
						let record = EntryRecord {
							dn: entry.dn,
							attrs: entry.attrs,
							bin_attrs: entry.bin_attrs,
						};
						if sender.send(CursorItem::Record(SearchRecord::Entry(record))).await.is_err()
						{
							// consumer dropped the cursor
							return;
						}
					}
					Ok(None) => break,
					Err(err) => {
						let _ = sender
							.send(CursorItem::Failed(map_ldap_error(
								OperationKind::Search,
								&base,
								err,
							)))
							.await;
						return;
					}
				}
			}

			let result = stream.finish().await;
			if !result.refs.is_empty() {
				let urls = parse_referral_urls(&result.refs);
				if !urls.is_empty()
					&& sender.send(CursorItem::Record(SearchRecord::Referral(urls))).await.is_err()
				{
					return;
				}
			}
			let item = match result.rc {
				// 3 = timeLimitExceeded, 4 = sizeLimitExceeded: the stream
				// is complete as far as the server will go
				0 | 10 => CursorItem::Done(SearchSummary { truncated: false }),
				3 | 4 => CursorItem::Done(SearchSummary { truncated: true }),
				_ => CursorItem::Failed(map_result(OperationKind::Search, &base, result)),
			};
			let _ = sender.send(item).await;
		});

		Ok(Box::new(Ldap3Cursor { receiver, task, summary: None, finished: false }))
	}

	async fn add(
		&mut self,
		dn: &Dn,
		attributes: &[(String, Vec<AttributeValue>)],
	) -> Result<(), Error> {
		let target = dn.to_string();
		let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
			.iter()
			.map(|(name, values)| {
				(
					name.clone().into_bytes(),
					values.iter().map(|v| v.as_bytes().to_vec()).collect(),
				)
			})
			.collect();
		let result = self
			.ldap
			.add(&target, attrs)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Create, &target, err))?;
		check_result(OperationKind::Create, &target, result)
	}

	async fn modify(&mut self, dn: &Dn, changes: &[ModifyOp]) -> Result<(), Error> {
		let target = dn.to_string();
		let mods: Vec<Mod<Vec<u8>>> = changes.iter().map(to_ldap3_mod).collect();
		let result = self
			.ldap
			.modify(&target, mods)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Modify, &target, err))?;
		check_result(OperationKind::Modify, &target, result)
	}

	async fn rename(&mut self, dn: &Dn, new_rdn: &Rdn, delete_old_rdn: bool) -> Result<(), Error> {
		let target = dn.to_string();
		let result = self
			.ldap
			.modifydn(&target, &new_rdn.to_string(), delete_old_rdn, None)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Rename, &target, err))?;
		check_result(OperationKind::Rename, &target, result)
	}

	async fn delete(&mut self, dn: &Dn) -> Result<(), Error> {
		let target = dn.to_string();
		let result = self
			.ldap
			.delete(&target)
			.await
			.map_err(|err| map_ldap_error(OperationKind::Delete, &target, err))?;
		check_result(OperationKind::Delete, &target, result)
	}

	async fn close(&mut self) -> Result<(), Error> {
		let outcome = self.ldap.unbind().await;
		self.driver.abort();
		outcome.map_err(|err| map_ldap_error(OperationKind::Connect, "", err))
	}
}

impl Drop for Ldap3Handle {
	fn drop(&mut self) {
		self.driver.abort();
	}
}

/// One message from the pump task to the cursor.
enum CursorItem {
	/// A streamed record.
	Record(SearchRecord),
	/// The stream finished; completion info attached.
	Done(SearchSummary),
	/// The stream failed.
	Failed(Error),
}

/// The consumer end of a streaming search.
struct Ldap3Cursor {
	/// Receives records from the pump task.
	receiver: mpsc::Receiver<CursorItem>,
	/// The pump task, aborted when the cursor is dropped.
	task: JoinHandle<()>,
	/// Completion info, set once the stream ends.
	summary: Option<SearchSummary>,
	/// Whether the stream has ended.
	finished: bool,
}

impl std::fmt::Debug for Ldap3Cursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Ldap3Cursor").field("finished", &self.finished).finish_non_exhaustive()
	}
}

#[async_trait]
impl RecordCursor for Ldap3Cursor {
	async fn next_record(&mut self) -> Result<Option<SearchRecord>, Error> {
		if self.finished {
			return Ok(None);
		}
		match self.receiver.recv().await {
			Some(CursorItem::Record(record)) => Ok(Some(record)),
			Some(CursorItem::Done(summary)) => {
				self.finished = true;
				self.summary = Some(summary);
				Ok(None)
			}
			Some(CursorItem::Failed(err)) => {
				self.finished = true;
				Err(err)
			}
			None => {
				self.finished = true;
				Err(Error::Transient {
					op: OperationKind::Search,
					reason: "result stream ended unexpectedly".to_owned(),
				})
			}
		}
	}

	fn summary(&self) -> Option<SearchSummary> {
		self.summary
	}
}

impl Drop for Ldap3Cursor {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Converts our modification representation into `ldap3`'s.
fn to_ldap3_mod(change: &ModifyOp) -> Mod<Vec<u8>> {
	let values = |vs: &[AttributeValue]| vs.iter().map(|v| v.as_bytes().to_vec()).collect();
	match change {
		ModifyOp::Add(attr, vs) => Mod::Add(attr.clone().into_bytes(), values(vs)),
		ModifyOp::Delete(attr, vs) => Mod::Delete(attr.clone().into_bytes(), values(vs)),
		ModifyOp::Replace(attr, vs) => Mod::Replace(attr.clone().into_bytes(), values(vs)),
	}
}

/// Converts our scope to `ldap3`'s.
fn search_scope(scope: SearchScope) -> Scope {
	match scope {
		SearchScope::Object => Scope::Base,
		SearchScope::OneLevel => Scope::OneLevel,
		SearchScope::Subtree => Scope::Subtree,
	}
}

/// Converts our alias dereferencing mode to `ldap3`'s.
fn deref_mode(aliases: AliasDereferencing) -> DerefAliases {
	match aliases {
		AliasDereferencing::Never => DerefAliases::Never,
		AliasDereferencing::Searching => DerefAliases::Searching,
		AliasDereferencing::Finding => DerefAliases::Finding,
		AliasDereferencing::Always => DerefAliases::Always,
	}
}

/// Parses referral target strings, dropping anything that is not a URL.
fn parse_referral_urls(refs: &[String]) -> Vec<Url> {
	refs.iter()
		.filter_map(|target| match Url::parse(target) {
			Ok(url) => Some(url),
			Err(err) => {
				warn!("ignoring unparsable referral target {target:?}: {err}");
				None
			}
		})
		.collect()
}

/// Accepts a success result, maps anything else into the taxonomy.
fn check_result(op: OperationKind, dn: &str, result: LdapResult) -> Result<(), Error> {
	if result.rc == 0 {
		Ok(())
	} else {
		Err(map_result(op, dn, result))
	}
}

/// Maps a non-zero LDAP result into the taxonomy. `busy` and `unavailable`
/// form the transient class eligible for the reconnect-once policy;
/// `referral` becomes the control-flow variant.
fn map_result(op: OperationKind, dn: &str, result: LdapResult) -> Error {
	match result.rc {
		51 | 52 => Error::Transient {
			op,
			reason: format!("server reported {}: {}", result.rc, result.text),
		},
		10 => Error::Referral { dn: dn.to_owned(), urls: parse_referral_urls(&result.refs) },
		_ => Error::Protocol { op, dn: dn.to_owned(), code: result.rc, text: result.text },
	}
}

/// Maps an `ldap3` error into the taxonomy. I/O-level failures form the
/// transient class; everything else is protocol-level.
fn map_ldap_error(op: OperationKind, dn: &str, err: LdapError) -> Error {
	match err {
		LdapError::Io { .. } | LdapError::EndOfStream => {
			Error::Transient { op, reason: err.to_string() }
		}
		LdapError::LdapResult { result } => map_result(op, dn, result),
		other => Error::Protocol { op, dn: dn.to_owned(), code: 0, text: other.to_string() },
	}
}

#[cfg(test)]
mod tests {
	use super::{map_result, parse_referral_urls};
	use crate::error::{Error, OperationKind};

	/// A result with the given code and empty diagnostics.
	fn result(rc: u32) -> ldap3::LdapResult {
		ldap3::LdapResult {
			rc,
			matched: String::new(),
			text: String::new(),
			refs: vec!["ldap://other.example.com/dc=example".to_owned()],
			ctrls: Vec::new(),
		}
	}

	#[test]
	fn busy_and_unavailable_are_transient() {
		assert!(map_result(OperationKind::Search, "", result(51)).is_transient());
		assert!(map_result(OperationKind::Search, "", result(52)).is_transient());
		assert!(!map_result(OperationKind::Search, "", result(50)).is_transient());
	}

	#[test]
	fn referral_results_become_the_control_flow_variant() {
		match map_result(OperationKind::Search, "dc=example", result(10)) {
			Error::Referral { dn, urls } => {
				assert_eq!(dn, "dc=example");
				assert_eq!(urls.len(), 1);
			}
			other => panic!("unexpected mapping: {other}"),
		}
	}

	#[test]
	fn unparsable_referral_targets_are_dropped() {
		let urls =
			parse_referral_urls(&["not a url".to_owned(), "ldap://ok.example".to_owned()]);
		assert_eq!(urls.len(), 1);
	}
}
