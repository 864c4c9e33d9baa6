//! Search requests and lazy result streaming.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::{
	config::{AliasDereferencing, ConnectionConfig, ReferralHandling},
	dn::Dn,
	error::Error,
	provider::{EntryRecord, ProviderHandle, RecordCursor, SearchRecord, SearchSummary},
	session::{self, StateCell},
};

/// The filter matching every entry.
pub const FILTER_TRUE: &str = "(objectClass=*)";

/// The attribute selection requesting no attributes at all.
pub const NO_ATTRIBUTES: &str = "1.1";

/// The attribute selection requesting all user attributes.
pub const ALL_USER_ATTRIBUTES: &str = "*";

/// The attribute selection requesting all operational attributes.
pub const ALL_OPERATIONAL_ATTRIBUTES: &str = "+";

/// The scope of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
	/// The base object only.
	Object,
	/// Direct subordinates of the base object.
	OneLevel,
	/// The base object and its whole subtree.
	Subtree,
}

/// One search request. Immutable once submitted; the fields are public
/// because a request is plain data assembled by the caller.
#[derive(Debug, Clone)]
pub struct SearchRequest {
	/// The base DN to search from.
	pub base: Dn,
	/// The search scope.
	pub scope: SearchScope,
	/// The filter string.
	pub filter: String,
	/// The requested attribute descriptors, or the `*`/`+`/`1.1` selectors.
	pub attributes: Vec<String>,
	/// Maximum entries to return, zero for no client limit.
	pub size_limit: i32,
	/// Maximum seconds to run, zero for no client limit.
	pub time_limit: i32,
	/// Alias dereferencing mode for this search.
	pub aliases: AliasDereferencing,
	/// How referral results are handled.
	pub referrals: ReferralHandling,
	/// Page size for the simple paged results control, `None` for unpaged.
	pub page_size: Option<i32>,
	/// Request the manage-DSA-IT control: referral entries are returned as
	/// plain entries instead of being acted on.
	pub manage_dsa_it: bool,
	/// Request the subentries control: subentries become visible to the
	/// search.
	pub subentries: bool,
}

impl SearchRequest {
	/// A request with the true filter, all user attributes and no limits.
	#[must_use]
	pub fn new(base: Dn, scope: SearchScope) -> Self {
		SearchRequest {
			base,
			scope,
			filter: FILTER_TRUE.to_owned(),
			attributes: vec![ALL_USER_ATTRIBUTES.to_owned()],
			size_limit: 0,
			time_limit: 0,
			aliases: AliasDereferencing::Never,
			referrals: ReferralHandling::Surface,
			page_size: None,
			manage_dsa_it: false,
			subentries: false,
		}
	}

	/// A request carrying the session configuration's default limits and
	/// dereferencing/referral modes.
	#[must_use]
	pub fn with_defaults(base: Dn, scope: SearchScope, config: &ConnectionConfig) -> Self {
		SearchRequest {
			size_limit: config.size_limit,
			time_limit: config.time_limit,
			aliases: config.aliases,
			referrals: config.referrals,
			page_size: config.page_size,
			..SearchRequest::new(base, scope)
		}
	}
}

/// A lazy, forward-only, single-pass stream of search results.
///
/// The stream holds the session's operation slot for its whole lifetime, so
/// no other operation can interleave with it on the same transport; drop or
/// exhaust it to release the session. It is not restartable: re-running a
/// search requires a new [`crate::session::Session::search`] call.
#[derive(Debug)]
pub struct RecordStream {
	/// The held operation slot; keeps the transport exclusively ours.
	guard: OwnedMutexGuard<Option<Box<dyn ProviderHandle>>>,
	/// The provider's cursor.
	cursor: Box<dyn RecordCursor>,
	/// Cancellation handle checked on every `next` call.
	cancel: CancellationToken,
	/// The owning session's state, for teardown on cancellation.
	state: Arc<StateCell>,
	/// Referral handling for this stream.
	referrals: ReferralHandling,
	/// Set once the stream has ended, successfully or not.
	finished: bool,
	/// Completion info, populated when the stream ends.
	summary: SearchSummary,
}

impl RecordStream {
	/// Wraps a provider cursor together with the held operation slot.
	pub(crate) fn new(
		guard: OwnedMutexGuard<Option<Box<dyn ProviderHandle>>>,
		cursor: Box<dyn RecordCursor>,
		cancel: CancellationToken,
		state: Arc<StateCell>,
		referrals: ReferralHandling,
	) -> Self {
		RecordStream {
			guard,
			cursor,
			cancel,
			state,
			referrals,
			finished: false,
			summary: SearchSummary::default(),
		}
	}

	/// The next record. Blocks on network I/O; reports `Error::Cancelled`
	/// and disconnects the session when the cancellation token fires while
	/// waiting. Referral records are skipped silently when the stream's
	/// referral mode is [`ReferralHandling::Ignore`].
	pub async fn next(&mut self) -> Result<Option<SearchRecord>, Error> {
		loop {
			if self.finished {
				return Ok(None);
			}
			let outcome = tokio::select! {
				biased;
				() = self.cancel.cancelled() => Err(Error::Cancelled),
				record = self.cursor.next_record() => record,
			};
			match outcome {
				Ok(Some(SearchRecord::Referral(urls)))
					if self.referrals == ReferralHandling::Ignore =>
				{
					tracing::debug!("ignoring referral to {urls:?}");
				}
				Ok(Some(record)) => return Ok(Some(record)),
				Ok(None) => {
					self.finished = true;
					self.summary = self.cursor.summary().unwrap_or_default();
					return Ok(None);
				}
				Err(err) => {
					self.finished = true;
					if matches!(err, Error::Cancelled) || err.is_transient() {
						session::teardown(&mut self.guard, &self.state).await;
					}
					return Err(err);
				}
			}
		}
	}

	/// Whether the server cut the result short. Meaningful once the stream
	/// has ended.
	#[must_use]
	pub fn truncated(&self) -> bool {
		self.summary.truncated
	}

	/// Drains the stream, separating entries from referral records. A
	/// convenience for small object-scope reads; browsing paths consume the
	/// stream record by record instead.
	pub async fn collect(&mut self) -> Result<(Vec<EntryRecord>, Vec<url::Url>), Error> {
		let mut entries = Vec::new();
		let mut referrals = Vec::new();
		while let Some(record) = self.next().await? {
			match record {
				SearchRecord::Entry(entry) => entries.push(entry),
				SearchRecord::Referral(urls) => referrals.extend(urls),
			}
		}
		Ok((entries, referrals))
	}
}
