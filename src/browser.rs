//! The session facade: end-to-end open, cache-backed browsing and writes.
//!
//! [`Browser`] ties the protocol session, the entry cache and the schema
//! cache together. Opening runs the bootstrap sequence (connect → bind →
//! root metadata → base DNs → schema); afterwards the load operations
//! populate the cache on demand and the write operations keep it
//! consistent, emitting one modification-log record per write.

use std::sync::{Arc, PoisonError, RwLock};

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	cache::{ChildrenSet, EntryCache, LoadKind, LoadTicket},
	config::{ConnectionConfig, ReferralHandling, ServerDialect},
	credentials::CredentialSource,
	dn::{Dn, Rdn},
	entry::{Attribute, AttributeSet, AttributeValue, Entry},
	error::{BootstrapStage, Error, OperationKind},
	ldif::{ImportSummary, LdifRecordSink, LdifRecordSource},
	modlog::{ModificationLogSink, ModificationRecord, TracingModificationLog},
	provider::{DirectoryProvider, EntryRecord, ModifyOp, SearchRecord},
	schema::{self, Schema, SchemaCache, SCHEMA_ATTRIBUTES, SCHEMA_FILTER},
	search::{
		RecordStream, SearchRequest, SearchScope, ALL_OPERATIONAL_ATTRIBUTES,
		ALL_USER_ATTRIBUTES, NO_ATTRIBUTES,
	},
	session::{Session, SessionState},
};

/// What a successful open reports back.
#[derive(Debug)]
pub struct BootstrapReport {
	/// The base DNs shown under the root, in discovery order.
	pub base_dns: Vec<Dn>,
	/// The server's vendor name, when published.
	pub vendor_name: Option<String>,
	/// Whether a non-fallback schema is active.
	pub schema_loaded: bool,
	/// Why the schema is unavailable, when it is. The session stays usable
	/// with the fallback schema.
	pub schema_error: Option<Error>,
}

/// One browsing session: protocol session, entry cache, schema cache and
/// the modification log, behind the operations the rest of the application
/// calls.
#[derive(Debug)]
pub struct Browser {
	/// The protocol session.
	session: Session,
	/// The entry cache; sole owner of all entries.
	cache: EntryCache,
	/// The schema cache.
	schema: SchemaCache,
	/// Receives one record per write operation.
	modlog: Arc<dyn ModificationLogSink>,
	/// The server dialect, selected at bootstrap.
	dialect: RwLock<&'static ServerDialect>,
	/// The schema subentry location discovered at bootstrap.
	subschema_dn: RwLock<Option<Dn>>,
}

impl Browser {
	/// Creates a closed browser over the given transport provider and
	/// credential source. Nothing connects until [`Browser::open`].
	#[must_use]
	pub fn new(
		config: ConnectionConfig,
		provider: Arc<dyn DirectoryProvider>,
		credentials: Arc<dyn CredentialSource>,
	) -> Self {
		Browser {
			session: Session::new(config, provider, credentials),
			cache: EntryCache::new(),
			schema: SchemaCache::new(),
			modlog: Arc::new(TracingModificationLog),
			dialect: RwLock::new(ServerDialect::detect(None, None)),
			subschema_dn: RwLock::new(None),
		}
	}

	/// Replaces the modification log sink.
	#[must_use]
	pub fn with_modification_log(mut self, sink: Arc<dyn ModificationLogSink>) -> Self {
		self.modlog = sink;
		self
	}

	/// The entry cache. Lookups are safe from any task at any time.
	#[must_use]
	pub fn cache(&self) -> &EntryCache {
		&self.cache
	}

	/// The current schema snapshot.
	#[must_use]
	pub fn schema(&self) -> Arc<Schema> {
		self.schema.current()
	}

	/// The protocol session state.
	#[must_use]
	pub fn state(&self) -> SessionState {
		self.session.state()
	}

	/// The dialect selected at bootstrap, generic before the first open.
	#[must_use]
	pub fn dialect(&self) -> &'static ServerDialect {
		*self.dialect.read().unwrap_or_else(PoisonError::into_inner)
	}

	/// Opens the session end to end: connect, bind, fetch the root
	/// metadata, determine the base DNs, load or revalidate the schema.
	///
	/// Any failing stage aborts with [`Error::Bootstrap`] naming it, and
	/// leaves the session disconnected. The schema stage is the exception: it
	/// degrades to the fallback schema and reports why in the returned
	/// report.
	pub async fn open(&self, cancel: &CancellationToken) -> Result<BootstrapReport, Error> {
		match self.bootstrap(cancel).await {
			Ok(report) => {
				info!(
					base_dns = report.base_dns.len(),
					schema_loaded = report.schema_loaded,
					"session opened"
				);
				Ok(report)
			}
			Err(err) => {
				self.session.close().await;
				self.cache.clear();
				self.schema.reset();
				Err(err)
			}
		}
	}

	/// Closes the session: drops the transport handle and clears all cached
	/// state. Connection parameters survive for reopening.
	pub async fn close(&self) {
		self.session.close().await;
		self.cache.clear();
		self.schema.reset();
		*self.subschema_dn.write().unwrap_or_else(PoisonError::into_inner) = None;
		info!("session closed");
	}

	/// Runs an arbitrary search. The stream holds the session's operation
	/// slot until finished or dropped; pipe entry records through
	/// [`EntryCache::put_or_merge`] to materialize them into the cache.
	pub async fn search(
		&self,
		request: &SearchRequest,
		cancel: &CancellationToken,
	) -> Result<RecordStream, Error> {
		self.session.search(request, cancel).await
	}

	/// Fetches an entry's full attributes unless already initialized.
	/// Concurrent calls for the same entry coalesce onto one search; a
	/// failed fetch leaves the entry uninitialized so the next call
	/// retries.
	pub async fn load_attributes(
		&self,
		dn: &Dn,
		cancel: &CancellationToken,
	) -> Result<Arc<Entry>, Error> {
		let schema = self.schema.current();
		let key = dn.normalized(&schema);
		loop {
			match self.cache.begin_load(LoadKind::Attributes, &key) {
				LoadTicket::Ready => return Ok(self.cache.get_or_create(dn, &schema)),
				LoadTicket::Wait(in_flight) => wait_for_load(&in_flight, cancel).await?,
				LoadTicket::Lead(_guard) => {
					let mut request = SearchRequest::with_defaults(
						dn.clone(),
						SearchScope::Object,
						self.session.config(),
					);
					request.attributes = vec![
						ALL_USER_ATTRIBUTES.to_owned(),
						ALL_OPERATIONAL_ATTRIBUTES.to_owned(),
					];
					let mut stream = self.session.search(&request, cancel).await?;
					let (records, referrals) = stream.collect().await?;
					drop(stream);

					let Some(record) = records.into_iter().next() else {
						if !referrals.is_empty() {
							return Err(Error::Referral { dn: dn.to_string(), urls: referrals });
						}
						return Err(Error::Protocol {
							op: OperationKind::Search,
							dn: dn.to_string(),
							code: 32,
							text: "no such object".to_owned(),
						});
					};
					return self.cache.put_or_merge(&record, &schema, true);
				}
			}
		}
	}

	/// Fetches an entry's children unless already initialized, merging each
	/// result into the cache in one pass. Subentries report no children
	/// without touching the network. Coalescing and failure semantics match
	/// [`Browser::load_attributes`].
	pub async fn load_children(
		&self,
		dn: &Dn,
		cancel: &CancellationToken,
	) -> Result<Vec<Arc<Entry>>, Error> {
		let schema = self.schema.current();
		if self.cache.get(dn, &schema).is_some_and(|entry| entry.flags().is_subentry()) {
			return Ok(Vec::new());
		}
		let key = dn.normalized(&schema);
		loop {
			match self.cache.begin_load(LoadKind::Children, &key) {
				LoadTicket::Ready => {
					return Ok(self.cache.child_entries(dn, &schema).unwrap_or_default())
				}
				LoadTicket::Wait(in_flight) => wait_for_load(&in_flight, cancel).await?,
				LoadTicket::Lead(_guard) => {
					let mut request = SearchRequest::with_defaults(
						dn.clone(),
						SearchScope::OneLevel,
						self.session.config(),
					);
					if let Some(filter) = self.cache.children_filter(dn, &schema) {
						request.filter = filter;
					}
					request.attributes = vec![
						"objectClass".to_owned(),
						"hasSubordinates".to_owned(),
						"numSubordinates".to_owned(),
					];

					let mut stream = self.session.search(&request, cancel).await?;
					let mut listing = ChildrenSet::new();
					let mut children = Vec::new();
					let mut referrals = Vec::new();
					loop {
						match stream.next().await? {
							Some(SearchRecord::Entry(record)) => {
								let child = self.cache.put_or_merge(&record, &schema, false)?;
								listing.push(child.dn().normalized(&schema));
								children.push(child);
							}
							Some(SearchRecord::Referral(urls)) => referrals.extend(urls),
							None => break,
						}
					}
					listing.set_has_more(stream.truncated());
					drop(stream);

					if !referrals.is_empty() {
						return Err(Error::Referral { dn: dn.to_string(), urls: referrals });
					}

					self.cache.set_children(dn, &schema, listing);
					if let Some(entry) = self.cache.get(dn, &schema) {
						entry.set_has_children_hint(!children.is_empty());
					}
					return Ok(children);
				}
			}
		}
	}

	/// Creates an entry and materializes it in the cache.
	pub async fn create_entry(
		&self,
		dn: &Dn,
		attributes: Vec<(String, Vec<AttributeValue>)>,
		cancel: &CancellationToken,
	) -> Result<Arc<Entry>, Error> {
		let result = self.session.add(dn, &attributes, cancel).await;
		self.log_modification(OperationKind::Create, dn, &result);
		result?;

		let schema = self.schema.current();
		let entry = self.cache.get_or_create(dn, &schema);
		let mut set = AttributeSet::new();
		for (description, values) in attributes {
			set.put(Attribute::new(description, values));
		}
		entry.apply_object_classes(set.texts("objectClass").into_iter());
		entry.set_has_children_hint(false);
		self.cache.set_attributes(dn, &schema, set);
		if let Some(parent) = dn.parent() {
			self.cache.add_child(&parent, dn, &schema);
			if let Some(parent_entry) = self.cache.get(&parent, &schema) {
				parent_entry.set_has_children_hint(true);
			}
		}
		Ok(entry)
	}

	/// Applies attribute modifications to an entry. The cached attribute
	/// set is dropped back to uninitialized so the next load refetches the
	/// server's view.
	pub async fn modify_entry(
		&self,
		dn: &Dn,
		changes: &[ModifyOp],
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let result = self.session.modify(dn, changes, cancel).await;
		self.log_modification(OperationKind::Modify, dn, &result);
		result?;
		self.cache.drop_attributes(dn, &self.schema.current());
		Ok(())
	}

	/// Renames an entry below the same parent, returning its new DN. The
	/// old subtree is invalidated recursively; descendants rematerialize
	/// under their new DNs on the next load.
	pub async fn rename_entry(
		&self,
		dn: &Dn,
		new_rdn: &Rdn,
		delete_old_rdn: bool,
		cancel: &CancellationToken,
	) -> Result<Dn, Error> {
		let result = self.session.rename(dn, new_rdn, delete_old_rdn, cancel).await;
		self.log_modification(OperationKind::Rename, dn, &result);
		result?;

		let schema = self.schema.current();
		self.cache.invalidate(dn, &schema, true);
		let new_dn = match dn.parent() {
			Some(parent) => parent.child(new_rdn.clone()),
			None => Dn::from_components(vec![new_rdn.clone()]),
		};
		if let Some(parent) = new_dn.parent() {
			self.cache.add_child(&parent, &new_dn, &schema);
		}
		Ok(new_dn)
	}

	/// Deletes an entry and invalidates its cached subtree.
	pub async fn delete_entry(&self, dn: &Dn, cancel: &CancellationToken) -> Result<(), Error> {
		let result = self.session.delete(dn, cancel).await;
		self.log_modification(OperationKind::Delete, dn, &result);
		result?;
		self.cache.invalidate(dn, &self.schema.current(), true);
		Ok(())
	}

	/// Revalidates the schema against the server, reloading when the
	/// server's subschema timestamp is strictly newer than the cached one.
	/// Returns whether a reload happened.
	pub async fn refresh_schema(&self, cancel: &CancellationToken) -> Result<bool, Error> {
		let subschema_dn = self
			.subschema_dn
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
			.ok_or_else(|| Error::SchemaUnavailable("session has not been opened".to_owned()))?;
		self.reload_schema_if_stale(&subschema_dn, cancel).await
	}

	/// Creates one entry per record from the source. Individual record
	/// failures are counted and logged, not fatal to the run.
	pub async fn import_records(
		&self,
		source: &mut dyn LdifRecordSource,
		cancel: &CancellationToken,
	) -> Result<ImportSummary, Error> {
		let mut summary = ImportSummary::default();
		while let Some(record) = source.next_record().await? {
			let outcome = async {
				let dn = Dn::parse(&record.dn)?;
				let attributes: Vec<(String, Vec<AttributeValue>)> = record
					.to_attribute_set()
					.iter()
					.map(|attr| (attr.description().to_owned(), attr.values().to_vec()))
					.collect();
				self.create_entry(&dn, attributes, cancel).await
			}
			.await;
			match outcome {
				Ok(_) => summary.imported += 1,
				Err(Error::Cancelled) => return Err(Error::Cancelled),
				Err(err) => {
					summary.failed += 1;
					warn!("import of {:?} failed: {err}", record.dn);
				}
			}
		}
		info!(imported = summary.imported, failed = summary.failed, "import finished");
		Ok(summary)
	}

	/// Streams every entry matched by the request into the sink, returning
	/// the record count.
	pub async fn export_records(
		&self,
		request: &SearchRequest,
		sink: &mut dyn LdifRecordSink,
		cancel: &CancellationToken,
	) -> Result<u64, Error> {
		let mut stream = self.session.search(request, cancel).await?;
		let mut exported = 0_u64;
		while let Some(record) = stream.next().await? {
			if let SearchRecord::Entry(entry) = record {
				sink.write_record(&entry).await?;
				exported += 1;
			}
		}
		Ok(exported)
	}

	/// The bootstrap sequence proper. Cache writes happen at the end, once
	/// the schema that keys the cache is settled.
	async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapReport, Error> {
		// root metadata
		let root_record = self
			.fetch_root_dse(cancel)
			.await
			.map_err(|err| err.at_stage(BootstrapStage::RootDse))?;
		let vendor_name = root_record.attr_first("vendorName").map(ToOwned::to_owned);
		let dialect =
			ServerDialect::detect(vendor_name.as_deref(), root_record.attr_first("vendorVersion"));
		*self.dialect.write().unwrap_or_else(PoisonError::into_inner) = dialect;
		debug!("selected {:?} dialect", dialect.kind);

		// base DNs
		let base_dns = self
			.determine_base_dns(&root_record, cancel)
			.await
			.map_err(|err| err.at_stage(BootstrapStage::BaseDns))?;
		let mut base_records = Vec::new();
		let mut found_bases = Vec::new();
		for base in &base_dns {
			match self.probe_base_entry(base, cancel).await {
				Ok(Some(record)) => {
					base_records.push(record);
					found_bases.push(base.clone());
				}
				Ok(None) => warn!("base DN {base} does not exist in the directory"),
				Err(Error::Cancelled) => return Err(Error::Cancelled),
				Err(err) if matches!(err, Error::Protocol { .. }) => {
					warn!("base DN {base} is not readable: {err}");
				}
				Err(err) => return Err(err.at_stage(BootstrapStage::BaseDns)),
			}
		}

		// schema location, then the schema itself (degrading on failure)
		let subschema_dn = self.locate_subschema(&root_record, dialect);
		*self.subschema_dn.write().unwrap_or_else(PoisonError::into_inner) =
			Some(subschema_dn.clone());
		let mut schema_loaded = false;
		let mut schema_error = None;
		match self.reload_schema_if_stale(&subschema_dn, cancel).await {
			Ok(_) => schema_loaded = !self.schema.current().is_fallback(),
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(err) => {
				warn!("schema unavailable, continuing with the fallback schema: {err}");
				schema_error = Some(err);
			}
		}

		// populate the cache under the settled schema
		let schema = self.schema.current();
		let root = self.cache.put_or_merge(&root_record, &schema, true)?;
		root.set_directory_entry(true);
		root.set_has_children_hint(true);

		let mut listing = ChildrenSet::new();
		for record in &base_records {
			let entry = self.cache.put_or_merge(record, &schema, false)?;
			entry.set_directory_entry(true);
			listing.push(entry.dn().normalized(&schema));
		}
		let schema_entry = self.cache.get_or_create(&subschema_dn, &schema);
		schema_entry.set_subentry(true);
		schema_entry.set_directory_entry(true);
		schema_entry.set_has_children_hint(false);
		listing.push(subschema_dn.normalized(&schema));
		self.cache.set_children(&Dn::root(), &schema, listing);

		Ok(BootstrapReport { base_dns: found_bases, vendor_name, schema_loaded, schema_error })
	}

	/// Reads the root DSE: an object-scope search at the empty DN for all
	/// user and operational attributes.
	async fn fetch_root_dse(&self, cancel: &CancellationToken) -> Result<EntryRecord, Error> {
		let mut request = SearchRequest::with_defaults(
			Dn::root(),
			SearchScope::Object,
			self.session.config(),
		);
		request.attributes =
			vec![ALL_USER_ATTRIBUTES.to_owned(), ALL_OPERATIONAL_ATTRIBUTES.to_owned()];
		request.referrals = ReferralHandling::Ignore;
		request.page_size = None;

		let mut stream = self.session.search(&request, cancel).await?;
		let (records, _) = stream.collect().await?;
		drop(stream);
		records.into_iter().next().ok_or_else(|| Error::Protocol {
			op: OperationKind::Search,
			dn: String::new(),
			code: 32,
			text: "the server returned no root DSE".to_owned(),
		})
	}

	/// The base DNs to show under the root: the configured one when set,
	/// else the root metadata's naming contexts. Servers reporting an empty
	/// naming context get the DNs found by a one-level
	/// search at the empty DN.
	async fn determine_base_dns(
		&self,
		root_record: &EntryRecord,
		cancel: &CancellationToken,
	) -> Result<Vec<Dn>, Error> {
		if let Some(base) = self.session.config().base_dn.as_deref().filter(|b| !b.is_empty()) {
			return Ok(vec![Dn::parse(base)?]);
		}

		let mut base_dns: Vec<Dn> = Vec::new();
		let mut need_fallback = false;
		let naming_contexts = root_record.attr_all("namingContexts");
		if naming_contexts.is_empty() {
			need_fallback = true;
		}
		for value in naming_contexts {
			// some servers terminate the value with a stray NUL
			let value = value.trim_end_matches('\u{0}');
			if value.is_empty() {
				// an empty naming context means "ask me", via a one-level
				// search at the empty DN
				need_fallback = true;
				continue;
			}
			match Dn::parse(value) {
				Ok(dn) => {
					if !base_dns.contains(&dn) {
						base_dns.push(dn);
					}
				}
				Err(err) => warn!("ignoring unparsable naming context {value:?}: {err}"),
			}
		}

		if need_fallback {
			let mut request = SearchRequest::with_defaults(
				Dn::root(),
				SearchScope::OneLevel,
				self.session.config(),
			);
			request.attributes = vec![NO_ATTRIBUTES.to_owned()];
			request.referrals = ReferralHandling::Ignore;
			let mut stream = self.session.search(&request, cancel).await?;
			let (records, _) = stream.collect().await?;
			drop(stream);
			for record in records {
				match Dn::parse(&record.dn) {
					Ok(dn) => {
						if !base_dns.contains(&dn) {
							base_dns.push(dn);
						}
					}
					Err(err) => warn!("ignoring unparsable entry DN {:?}: {err}", record.dn),
				}
			}
		}
		Ok(base_dns)
	}

	/// Checks that a base DN exists, returning its record with the
	/// children-hint attributes.
	async fn probe_base_entry(
		&self,
		base: &Dn,
		cancel: &CancellationToken,
	) -> Result<Option<EntryRecord>, Error> {
		let mut request = SearchRequest::with_defaults(
			base.clone(),
			SearchScope::Object,
			self.session.config(),
		);
		request.attributes = vec!["objectClass".to_owned(), "hasSubordinates".to_owned()];
		request.size_limit = 1;
		request.referrals = ReferralHandling::Ignore;
		let mut stream = self.session.search(&request, cancel).await?;
		let (records, _) = stream.collect().await?;
		drop(stream);
		Ok(records.into_iter().next())
	}

	/// Where the schema subentry lives: the root metadata's pointer, or the
	/// dialect's fallback location when the server does not publish one.
	fn locate_subschema(&self, root_record: &EntryRecord, dialect: &'static ServerDialect) -> Dn {
		if let Some(pointer) = root_record.attr_first("subschemaSubentry") {
			match Dn::parse(pointer) {
				Ok(dn) => return dn,
				Err(err) => warn!("unparsable subschemaSubentry {pointer:?}: {err}"),
			}
		}
		debug!("no schema location published, trying {}", dialect.schema_dn_fallback);
		Dn::parse(dialect.schema_dn_fallback).unwrap_or_else(|_| Dn::root())
	}

	/// Probes the subschema entry's timestamps and reloads the schema when
	/// the cached snapshot is stale. Returns whether a reload happened.
	async fn reload_schema_if_stale(
		&self,
		subschema_dn: &Dn,
		cancel: &CancellationToken,
	) -> Result<bool, Error> {
		let dialect = self.dialect();

		// cheap probe first: timestamps only
		let mut probe = SearchRequest::with_defaults(
			subschema_dn.clone(),
			SearchScope::Object,
			self.session.config(),
		);
		probe.attributes = vec![
			dialect.modify_timestamp_attribute.to_owned(),
			dialect.create_timestamp_attribute.to_owned(),
		];
		probe.referrals = ReferralHandling::Ignore;
		let mut stream = self.session.search(&probe, cancel).await?;
		let (records, _) = stream.collect().await?;
		drop(stream);
		let Some(record) = records.into_iter().next() else {
			return Err(Error::SchemaUnavailable(format!(
				"no schema entry at {subschema_dn}"
			)));
		};
		let server_timestamp = record
			.attr_first(dialect.modify_timestamp_attribute)
			.or_else(|| record.attr_first(dialect.create_timestamp_attribute))
			.and_then(schema::parse_generalized_time);
		if !self.schema.is_stale(server_timestamp) {
			debug!("schema is up to date");
			return Ok(false);
		}

		// full fetch
		let mut request = SearchRequest::with_defaults(
			subschema_dn.clone(),
			SearchScope::Object,
			self.session.config(),
		);
		request.filter = SCHEMA_FILTER.to_owned();
		request.attributes = SCHEMA_ATTRIBUTES.iter().map(|a| (*a).to_owned()).collect();
		request.referrals = ReferralHandling::Ignore;
		let mut stream = self.session.search(&request, cancel).await?;
		let (records, _) = stream.collect().await?;
		drop(stream);
		let Some(record) = records.into_iter().next() else {
			return Err(Error::SchemaUnavailable("the schema search returned no results".to_owned()));
		};

		let snapshot = Schema::from_subschema(&record.to_attribute_set(), dialect);
		info!(
			object_classes = snapshot.object_class_count(),
			attribute_types = snapshot.attribute_type_count(),
			"schema loaded"
		);
		self.schema.install(snapshot);
		Ok(true)
	}

	/// Emits one modification-log record. Sink failures are logged, never
	/// propagated.
	fn log_modification(&self, op: OperationKind, dn: &Dn, result: &Result<(), Error>) {
		let record = ModificationRecord {
			timestamp: OffsetDateTime::now_utc(),
			dn: dn.to_string(),
			operation: op,
			result_code: match result {
				Ok(()) => 0,
				Err(err) => err.result_code().unwrap_or(1),
			},
			success: result.is_ok(),
		};
		if let Err(err) = self.modlog.record(&record) {
			warn!("failed to write the modification log: {err}");
		}
	}
}

/// Waits for another task's in-flight load to settle, honoring
/// cancellation. The caller re-checks the cache afterwards.
async fn wait_for_load(
	in_flight: &Arc<tokio::sync::Mutex<()>>,
	cancel: &CancellationToken,
) -> Result<(), Error> {
	tokio::select! {
		biased;
		() = cancel.cancelled() => Err(Error::Cancelled),
		_guard = in_flight.lock() => Ok(()),
	}
}
