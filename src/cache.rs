//! The per-session entry cache.
//!
//! The cache is the sole owner of all [`Entry`] instances, keyed by the
//! OID-canonical DN string. Attribute and children state live in side
//! tables under the same key, so parent/child relations are DN lookups
//! rather than object references and teardown is clearing the maps, not a
//! graph walk. Lookups never perform network I/O.
//!
//! Concurrency: one writer, the session holding the operation slot,
//! mutates the maps; lookups from other tasks are safe at any time. The
//! lock ordering is entries, attributes, children; no lock is held across
//! an await point.
//!
//! Invalidation policy: a non-recursive `invalidate` detaches the entry
//! from its parent's children list and removes only that entry; cached
//! descendants are kept orphaned (unreachable from the tree) rather than
//! cascaded, preserving identity for callers still holding them.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex, PoisonError, RwLock},
};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::{
	dn::Dn,
	entry::{AttributeSet, Entry},
	error::Error,
	provider::EntryRecord,
	schema::Schema,
};

/// The cached children state of one entry: an insertion-ordered set of
/// child cache keys plus the pagination-incomplete marker.
#[derive(Debug, Clone, Default)]
pub struct ChildrenSet {
	/// Child cache keys in insertion order.
	children: Vec<String>,
	/// Whether the listing was cut short by a size or time limit.
	has_more: bool,
}

impl ChildrenSet {
	/// An empty, complete children set.
	#[must_use]
	pub fn new() -> Self {
		ChildrenSet::default()
	}

	/// Appends a child key unless already present.
	pub fn push(&mut self, key: String) {
		if !self.children.contains(&key) {
			self.children.push(key);
		}
	}

	/// Removes a child key if present.
	pub fn remove(&mut self, key: &str) {
		self.children.retain(|c| c != key);
	}

	/// The child cache keys in insertion order.
	#[must_use]
	pub fn children(&self) -> &[String] {
		&self.children
	}

	/// Whether the listing is known to be incomplete.
	#[must_use]
	pub fn has_more(&self) -> bool {
		self.has_more
	}

	/// Marks the listing as cut short.
	pub fn set_has_more(&mut self, has_more: bool) {
		self.has_more = has_more;
	}

	/// The number of cached children.
	#[must_use]
	pub fn len(&self) -> usize {
		self.children.len()
	}

	/// Whether no children are cached.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.children.is_empty()
	}
}

/// Which per-entry side table a load initializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LoadKind {
	/// The attribute table.
	Attributes,
	/// The children table.
	Children,
}

/// The outcome of asking to start an initializing load.
pub(crate) enum LoadTicket<'a> {
	/// The data is already initialized; nothing to fetch.
	Ready,
	/// Another load for the same entry is in flight; lock the contained
	/// mutex to wait for its completion, then re-check.
	Wait(Arc<AsyncMutex<()>>),
	/// The caller leads the load. Dropping the guard (after success or
	/// failure) releases the waiters.
	Lead(LoadGuard<'a>),
}

/// Held by the single task performing an initializing load. A failed load
/// simply drops the guard without storing data, leaving the entry
/// uninitialized so the next call retries.
pub(crate) struct LoadGuard<'a> {
	/// The owning cache.
	cache: &'a EntryCache,
	/// Which side table is being initialized.
	kind: LoadKind,
	/// The cache key being loaded.
	key: String,
	/// Keeps waiters blocked until the guard drops.
	_permit: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for LoadGuard<'_> {
	fn drop(&mut self) {
		self.cache
			.pending(self.kind)
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.key);
	}
}

/// The per-session entry cache.
#[derive(Debug, Default)]
pub struct EntryCache {
	/// All live entries by cache key. Identity of a cached entry for a
	/// given DN is stable for the session's lifetime.
	entries: RwLock<HashMap<String, Arc<Entry>>>,
	/// Initialized attribute sets by cache key. Absence means "unknown",
	/// which is distinct from "known and empty".
	attributes: RwLock<HashMap<String, AttributeSet>>,
	/// Initialized children listings by cache key.
	children: RwLock<HashMap<String, ChildrenSet>>,
	/// Per-entry children filter overrides, independent of whether the
	/// children have been fetched yet.
	children_filters: RwLock<HashMap<String, String>>,
	/// In-flight attribute loads, for coalescing.
	pending_attributes: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
	/// In-flight children loads, for coalescing.
	pending_children: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EntryCache {
	/// An empty cache.
	#[must_use]
	pub fn new() -> Self {
		EntryCache::default()
	}

	/// O(1) lookup by DN. Never performs network I/O.
	#[must_use]
	pub fn get(&self, dn: &Dn, schema: &Schema) -> Option<Arc<Entry>> {
		self.entries
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&dn.normalized(schema))
			.cloned()
	}

	/// The cached entry for a DN, materializing it if absent.
	#[must_use]
	pub fn get_or_create(&self, dn: &Dn, schema: &Schema) -> Arc<Entry> {
		let key = dn.normalized(schema);
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		Arc::clone(entries.entry(key).or_insert_with(|| Arc::new(Entry::new(dn.clone()))))
	}

	/// Materializes or updates the cached entry for a search result.
	///
	/// An existing entry keeps its identity; only flags are updated, plus
	/// the attribute table when `complete_attributes` says the record
	/// carries a full attribute fetch. A partial record merges its
	/// attributes into an already-initialized set but never flips an
	/// uninitialized entry to initialized.
	pub fn put_or_merge(
		&self,
		record: &EntryRecord,
		schema: &Schema,
		complete_attributes: bool,
	) -> Result<Arc<Entry>, Error> {
		let dn = Dn::parse(&record.dn)?;
		let entry = self.get_or_create(&dn, schema);
		let key = dn.normalized(schema);

		let object_classes = record.attr_all("objectClass");
		if !object_classes.is_empty() {
			entry.apply_object_classes(object_classes.into_iter());
		}
		if let Some(has_subordinates) = record.bool_first("hasSubordinates") {
			entry.set_has_children_hint(has_subordinates);
		} else if let Some(count) = record.attr_first("numSubordinates") {
			entry.set_has_children_hint(count.parse::<u64>().map_or(true, |n| n > 0));
		}

		let mut attributes = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
		if complete_attributes {
			attributes.insert(key, record.to_attribute_set());
		} else if let Some(existing) = attributes.get_mut(&key) {
			for attribute in record.to_attribute_set().iter() {
				existing.put(attribute.clone());
			}
		}
		Ok(entry)
	}

	/// The initialized attribute set of an entry. `None` until a full fetch
	/// has completed: unknown, as opposed to known-and-empty.
	#[must_use]
	pub fn attributes(&self, dn: &Dn, schema: &Schema) -> Option<AttributeSet> {
		self.attributes
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&dn.normalized(schema))
			.cloned()
	}

	/// Drops an entry's attribute set back to uninitialized, forcing a
	/// refetch on the next load. Used after modifications.
	pub fn drop_attributes(&self, dn: &Dn, schema: &Schema) {
		self.attributes
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&dn.normalized(schema));
	}

	/// Stores a full attribute set for an entry, marking it initialized.
	pub fn set_attributes(&self, dn: &Dn, schema: &Schema, attributes: AttributeSet) {
		self.attributes
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(dn.normalized(schema), attributes);
	}

	/// The cached children listing. A subentry always reports an empty,
	/// complete listing regardless of cache contents. `None` means the
	/// children have not been fetched.
	#[must_use]
	pub fn children(&self, dn: &Dn, schema: &Schema) -> Option<ChildrenSet> {
		if self.get(dn, schema).is_some_and(|entry| entry.flags().is_subentry()) {
			return Some(ChildrenSet::new());
		}
		self.children
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&dn.normalized(schema))
			.cloned()
	}

	/// The cached child entries in listing order, `None` when the children
	/// have not been fetched.
	#[must_use]
	pub fn child_entries(&self, dn: &Dn, schema: &Schema) -> Option<Vec<Arc<Entry>>> {
		let listing = self.children(dn, schema)?;
		let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
		Some(listing.children().iter().filter_map(|key| entries.get(key).cloned()).collect())
	}

	/// Stores a children listing, marking the entry's children initialized.
	pub fn set_children(&self, dn: &Dn, schema: &Schema, listing: ChildrenSet) {
		self.children
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(dn.normalized(schema), listing);
	}

	/// Appends a child to an already-initialized listing; no-op while the
	/// parent's children are unfetched.
	pub fn add_child(&self, parent: &Dn, child: &Dn, schema: &Schema) {
		let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
		if let Some(listing) = children.get_mut(&parent.normalized(schema)) {
			listing.push(child.normalized(schema));
		}
	}

	/// The children filter override of an entry, if any.
	#[must_use]
	pub fn children_filter(&self, dn: &Dn, schema: &Schema) -> Option<String> {
		self.children_filters
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&dn.normalized(schema))
			.cloned()
	}

	/// Sets or clears the children filter override of an entry. Takes
	/// effect on the next children load.
	pub fn set_children_filter(&self, dn: &Dn, schema: &Schema, filter: Option<String>) {
		let key = dn.normalized(schema);
		let mut filters = self.children_filters.write().unwrap_or_else(PoisonError::into_inner);
		match filter {
			Some(filter) => {
				filters.insert(key, filter);
			}
			None => {
				filters.remove(&key);
			}
		}
	}

	/// Removes an entry, detaching it from its parent's listing. With
	/// `recursive`, all cached descendants reachable through children
	/// listings are removed too; without it they are kept orphaned.
	pub fn invalidate(&self, dn: &Dn, schema: &Schema, recursive: bool) {
		let key = dn.normalized(schema);
		if let Some(parent) = dn.parent() {
			let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
			if let Some(listing) = children.get_mut(&parent.normalized(schema)) {
				listing.remove(&key);
			}
		}

		let mut doomed = vec![key.clone()];
		if recursive {
			let children = self.children.read().unwrap_or_else(PoisonError::into_inner);
			let mut queue = vec![key];
			while let Some(current) = queue.pop() {
				if let Some(listing) = children.get(&current) {
					for child in listing.children() {
						doomed.push(child.clone());
						queue.push(child.clone());
					}
				}
			}
		}

		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		let mut attributes = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
		let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
		let mut filters = self.children_filters.write().unwrap_or_else(PoisonError::into_inner);
		for key in &doomed {
			entries.remove(key);
			attributes.remove(key);
			children.remove(key);
			filters.remove(key);
		}
		debug!("invalidated {} cache entries", doomed.len());
	}

	/// Clears every map. Used on session close.
	pub fn clear(&self) {
		self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
		self.attributes.write().unwrap_or_else(PoisonError::into_inner).clear();
		self.children.write().unwrap_or_else(PoisonError::into_inner).clear();
		self.children_filters.write().unwrap_or_else(PoisonError::into_inner).clear();
	}

	/// The number of cached entries.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	/// Whether the cache holds no entries.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Asks to start an initializing load for an entry, coalescing
	/// concurrent duplicates: at most one load per entry and table is in
	/// flight at any time.
	pub(crate) fn begin_load(&self, kind: LoadKind, key: &str) -> LoadTicket<'_> {
		let initialized = match kind {
			LoadKind::Attributes => self
				.attributes
				.read()
				.unwrap_or_else(PoisonError::into_inner)
				.contains_key(key),
			LoadKind::Children => {
				self.children.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
			}
		};
		if initialized {
			return LoadTicket::Ready;
		}

		let mut pending = self.pending(kind).lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(in_flight) = pending.get(key) {
			return LoadTicket::Wait(Arc::clone(in_flight));
		}
		let lock = Arc::new(AsyncMutex::new(()));
		match Arc::clone(&lock).try_lock_owned() {
			Ok(permit) => {
				pending.insert(key.to_owned(), lock);
				LoadTicket::Lead(LoadGuard { cache: self, kind, key: key.to_owned(), _permit: permit })
			}
			// freshly created mutex; contention here means another leader
			// raced us, so wait on it
			Err(_) => LoadTicket::Wait(lock),
		}
	}

	/// The pending-load table for a load kind.
	fn pending(&self, kind: LoadKind) -> &StdMutex<HashMap<String, Arc<AsyncMutex<()>>>> {
		match kind {
			LoadKind::Attributes => &self.pending_attributes,
			LoadKind::Children => &self.pending_children,
		}
	}
}
