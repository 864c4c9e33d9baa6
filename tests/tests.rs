#![allow(
	clippy::dbg_macro,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used
)]

use std::sync::{Arc, Mutex};

use ldap_browser::{
	browser::Browser,
	config::ConnectionConfig,
	credentials::StoredCredentials,
	dn::{Dn, Rdn},
	entry::AttributeValue,
	error::{BootstrapStage, Error, OperationKind},
	ldif::{VecRecordSink, VecRecordSource},
	modlog::{ModificationLogSink, ModificationRecord},
	provider::EntryRecord,
	provider::ModifyOp,
	search::{SearchRequest, SearchScope},
	session::SessionState,
	transport::Ldap3Provider,
};
use tokio_util::sync::CancellationToken;
use url::Url;

mod common;

use common::{Fail, StubDirectory};

fn browser_over(stub: &StubDirectory) -> Browser {
	let config = ConnectionConfig::new(Url::parse("ldap://stub.invalid").unwrap());
	Browser::new(
		config,
		Arc::new(stub.clone()),
		Arc::new(StoredCredentials::new("cn=admin,dc=example,dc=com", "secret")),
	)
}

async fn opened_browser() -> (StubDirectory, Arc<Browser>, CancellationToken) {
	let stub = StubDirectory::with_example_tree();
	let browser = Arc::new(browser_over(&stub));
	let cancel = CancellationToken::new();
	browser.open(&cancel).await.unwrap();
	(stub, browser, cancel)
}

#[derive(Debug, Default, Clone)]
struct CollectingLog(Arc<Mutex<Vec<ModificationRecord>>>);

impl ModificationLogSink for CollectingLog {
	fn record(&self, record: &ModificationRecord) -> std::io::Result<()> {
		self.0.lock().unwrap().push(record.clone());
		Ok(())
	}
}

#[tokio::test]
async fn bootstrap_example_scenario() {
	let stub = StubDirectory::with_example_tree();
	let browser = browser_over(&stub);
	let cancel = CancellationToken::new();

	let report = browser.open(&cancel).await.unwrap();

	assert_eq!(browser.state(), SessionState::Bound);
	assert_eq!(report.base_dns, vec![Dn::parse("dc=example,dc=com").unwrap()]);
	assert_eq!(report.vendor_name.as_deref(), Some("Example Directory"));
	assert!(report.schema_loaded);
	assert!(report.schema_error.is_none());

	let schema = browser.schema();
	assert!(!schema.is_fallback());
	assert_eq!(schema.attribute_oid("commonName"), Some("2.5.4.3"));

	let base = Dn::parse("dc=example,dc=com").unwrap();
	let root_children = browser.cache().child_entries(&Dn::root(), &schema).unwrap();
	let base_children: Vec<_> =
		root_children.iter().filter(|child| child.dn() == &base).collect();
	assert_eq!(base_children.len(), 1, "exactly one child for the naming context");
	assert!(base_children[0].flags().has_children_hint());

	let schema_entry =
		browser.cache().get(&Dn::parse("cn=schema").unwrap(), &schema).unwrap();
	assert!(schema_entry.flags().is_subentry());
}

#[tokio::test]
async fn cached_entries_keep_identity_across_merges() {
	let (_stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();
	let people = Dn::parse("ou=people,dc=example,dc=com").unwrap();

	let from_attributes = browser.load_attributes(&alice, &cancel).await.unwrap();
	let children = browser.load_children(&people, &cancel).await.unwrap();
	let from_children = children.iter().find(|c| c.dn() == &alice).unwrap();

	assert!(Arc::ptr_eq(&from_attributes, from_children));
	let from_cache = browser.cache().get(&alice, &browser.schema()).unwrap();
	assert!(Arc::ptr_eq(&from_attributes, &from_cache));
}

#[tokio::test]
async fn concurrent_attribute_loads_coalesce() {
	let (stub, browser, cancel) = opened_browser().await;
	let bob = Dn::parse("cn=bob,ou=people,dc=example,dc=com").unwrap();
	let searches_before = stub.searches();

	let mut tasks = Vec::new();
	for _ in 0..8 {
		let browser = Arc::clone(&browser);
		let bob = bob.clone();
		let cancel = cancel.clone();
		tasks.push(tokio::spawn(async move {
			browser.load_attributes(&bob, &cancel).await.unwrap()
		}));
	}
	let mut loaded = Vec::new();
	for task in tasks {
		loaded.push(task.await.unwrap());
	}

	assert_eq!(
		stub.searches(),
		searches_before + 1,
		"concurrent loads coalesce to one underlying search"
	);
	for entry in &loaded[1..] {
		assert!(Arc::ptr_eq(&loaded[0], entry));
	}
}

#[tokio::test]
async fn transient_failure_reconnects_exactly_once() {
	let (stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();
	assert_eq!(stub.connects(), 1);

	stub.script(OperationKind::Modify, Fail::Transient);
	let change = ModifyOp::Replace(
		"sn".to_owned(),
		vec![AttributeValue::Text("Smith".to_owned())],
	);
	browser.modify_entry(&alice, &[change], &cancel).await.unwrap();

	assert_eq!(stub.connects(), 2, "exactly one reconnect");
	assert_eq!(stub.binds(), 2, "the reconnect rebinds");
}

#[tokio::test]
async fn second_transient_failure_surfaces() {
	let (stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();

	stub.script(OperationKind::Modify, Fail::Transient);
	stub.script(OperationKind::Modify, Fail::Transient);
	let change = ModifyOp::Replace(
		"sn".to_owned(),
		vec![AttributeValue::Text("Smith".to_owned())],
	);
	let result = browser.modify_entry(&alice, &[change], &cancel).await;

	assert!(matches!(result, Err(Error::Transient { .. })), "no unbounded retry loop");
	assert_eq!(stub.connects(), 2, "one retry, not more");
}

#[tokio::test]
async fn search_issue_retries_after_transient_failure() {
	let (stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();

	stub.script(OperationKind::Search, Fail::Transient);
	let entry = browser.load_attributes(&alice, &cancel).await.unwrap();

	assert_eq!(entry.dn(), &alice);
	assert_eq!(stub.connects(), 2, "the search was re-issued over a fresh connection");
}

#[tokio::test]
async fn protocol_failures_are_not_retried() {
	let (stub, browser, cancel) = opened_browser().await;
	let connects_before = stub.connects();

	let missing = Dn::parse("cn=missing,dc=example,dc=com").unwrap();
	let result = browser.delete_entry(&missing, &cancel).await;

	assert!(matches!(result, Err(Error::Protocol { code: 32, .. })));
	assert_eq!(stub.connects(), connects_before, "no reconnect for protocol failures");
}

#[tokio::test]
async fn cancellation_leaves_no_half_open_handle() {
	let (stub, browser, cancel) = opened_browser().await;
	let base = Dn::parse("dc=example,dc=com").unwrap();

	stub.set_hang_searches(true);
	let task_cancel = cancel.clone();
	let task_browser = Arc::clone(&browser);
	let task_base = base.clone();
	let task = tokio::spawn(async move {
		task_browser.load_children(&task_base, &task_cancel).await
	});

	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
	cancel.cancel();
	let outcome = task.await.unwrap();

	assert!(matches!(outcome, Err(Error::Cancelled)), "cancellation is a distinct outcome");
	assert_eq!(browser.state(), SessionState::Disconnected);

	// the next operation performs a fresh connect and bind
	stub.set_hang_searches(false);
	let connects_before = stub.connects();
	let binds_before = stub.binds();
	let children = browser.load_children(&base, &CancellationToken::new()).await.unwrap();
	assert_eq!(children.len(), 1);
	assert_eq!(stub.connects(), connects_before + 1);
	assert_eq!(stub.binds(), binds_before + 1);
	assert_eq!(browser.state(), SessionState::Bound);
}

#[tokio::test]
async fn schema_reloads_only_when_strictly_newer() {
	let (stub, browser, cancel) = opened_browser().await;
	let loaded = browser.schema();
	assert!(!loaded.is_fallback());

	assert!(
		!browser.refresh_schema(&cancel).await.unwrap(),
		"an unchanged timestamp triggers no reload"
	);
	assert!(
		Arc::ptr_eq(&loaded, &browser.schema()),
		"the snapshot is untouched without a reload"
	);

	stub.set_schema_timestamp("20240401120000Z");
	assert!(browser.refresh_schema(&cancel).await.unwrap(), "a newer timestamp reloads once");
	assert!(!Arc::ptr_eq(&loaded, &browser.schema()));

	assert!(!browser.refresh_schema(&cancel).await.unwrap());
}

#[tokio::test]
async fn bootstrap_reports_the_failing_stage() {
	let stub = StubDirectory::with_example_tree();
	stub.script(OperationKind::Connect, Fail::ConnectRefused);
	let browser = browser_over(&stub);
	let result = browser.open(&CancellationToken::new()).await;
	match result {
		Err(Error::Bootstrap { stage, .. }) => assert_eq!(stage, BootstrapStage::Connect),
		other => panic!("expected a connect-stage failure, got {other:?}"),
	}
	assert_eq!(browser.state(), SessionState::Disconnected);

	let stub = StubDirectory::with_example_tree();
	stub.script(OperationKind::Bind, Fail::BadCredentials);
	let browser = browser_over(&stub);
	match browser.open(&CancellationToken::new()).await {
		Err(Error::Bootstrap { stage, .. }) => assert_eq!(stage, BootstrapStage::Bind),
		other => panic!("expected a bind-stage failure, got {other:?}"),
	}
	assert_eq!(browser.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn delete_invalidates_the_cached_subtree() {
	let (stub, browser, cancel) = opened_browser().await;
	let base = Dn::parse("dc=example,dc=com").unwrap();
	let people = Dn::parse("ou=people,dc=example,dc=com").unwrap();
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();

	browser.load_children(&base, &cancel).await.unwrap();
	browser.load_children(&people, &cancel).await.unwrap();
	let schema = browser.schema();
	assert!(browser.cache().get(&alice, &schema).is_some());

	browser.delete_entry(&people, &cancel).await.unwrap();

	assert!(!stub.has_entry("ou=people,dc=example,dc=com"));
	assert!(browser.cache().get(&people, &schema).is_none());
	assert!(browser.cache().get(&alice, &schema).is_none(), "descendants are invalidated too");
	let base_children = browser.cache().child_entries(&base, &schema).unwrap();
	assert!(base_children.iter().all(|c| c.dn() != &people));
}

#[tokio::test]
async fn rename_returns_the_new_dn_and_invalidates_the_old() {
	let (stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();
	browser.load_attributes(&alice, &cancel).await.unwrap();

	let new_dn = browser
		.rename_entry(&alice, &Rdn::new("cn", "carol"), true, &cancel)
		.await
		.unwrap();

	assert_eq!(new_dn, Dn::parse("cn=carol,ou=people,dc=example,dc=com").unwrap());
	assert!(stub.has_entry("cn=carol,ou=people,dc=example,dc=com"));
	assert!(!stub.has_entry("cn=alice,ou=people,dc=example,dc=com"));
	assert!(browser.cache().get(&alice, &browser.schema()).is_none());
}

#[tokio::test]
async fn create_appends_to_loaded_children() {
	let (stub, browser, cancel) = opened_browser().await;
	let people = Dn::parse("ou=people,dc=example,dc=com").unwrap();
	assert_eq!(browser.load_children(&people, &cancel).await.unwrap().len(), 2);

	let dora = Dn::parse("cn=dora,ou=people,dc=example,dc=com").unwrap();
	browser
		.create_entry(
			&dora,
			vec![
				(
					"objectClass".to_owned(),
					vec![
						AttributeValue::Text("top".to_owned()),
						AttributeValue::Text("inetOrgPerson".to_owned()),
					],
				),
				("cn".to_owned(), vec![AttributeValue::Text("dora".to_owned())]),
				("sn".to_owned(), vec![AttributeValue::Text("Dell".to_owned())]),
			],
			&cancel,
		)
		.await
		.unwrap();

	assert!(stub.has_entry("cn=dora,ou=people,dc=example,dc=com"));
	let schema = browser.schema();
	assert!(
		browser.cache().attributes(&dora, &schema).is_some(),
		"creation initializes the attribute cache"
	);
	let children = browser.cache().child_entries(&people, &schema).unwrap();
	assert_eq!(children.len(), 3);
}

#[tokio::test]
async fn modification_resets_the_attribute_cache() {
	let (_stub, browser, cancel) = opened_browser().await;
	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();

	browser.load_attributes(&alice, &cancel).await.unwrap();
	let schema = browser.schema();
	assert_eq!(
		browser.cache().attributes(&alice, &schema).unwrap().first_text("sn"),
		Some("Aman")
	);

	let change = ModifyOp::Replace(
		"sn".to_owned(),
		vec![AttributeValue::Text("Smith".to_owned())],
	);
	browser.modify_entry(&alice, &[change], &cancel).await.unwrap();
	assert!(
		browser.cache().attributes(&alice, &schema).is_none(),
		"modified entries fall back to uninitialized"
	);

	browser.load_attributes(&alice, &cancel).await.unwrap();
	assert_eq!(
		browser.cache().attributes(&alice, &schema).unwrap().first_text("sn"),
		Some("Smith")
	);
}

#[tokio::test]
async fn import_and_export_stream_records() {
	let (stub, browser, cancel) = opened_browser().await;

	let mut source = VecRecordSource::new(vec![
		EntryRecord {
			dn: "cn=eve,ou=people,dc=example,dc=com".to_owned(),
			attrs: [
				("objectClass".to_owned(), vec!["inetOrgPerson".to_owned()]),
				("cn".to_owned(), vec!["eve".to_owned()]),
				("sn".to_owned(), vec!["Evans".to_owned()]),
			]
			.into_iter()
			.collect(),
			bin_attrs: std::collections::HashMap::new(),
		},
		EntryRecord {
			dn: "not a dn".to_owned(),
			attrs: std::collections::HashMap::new(),
			bin_attrs: std::collections::HashMap::new(),
		},
	]);
	let summary = browser.import_records(&mut source, &cancel).await.unwrap();
	assert_eq!(summary.imported, 1);
	assert_eq!(summary.failed, 1, "bad records are counted, not fatal");
	assert!(stub.has_entry("cn=eve,ou=people,dc=example,dc=com"));

	let request = SearchRequest::new(
		Dn::parse("ou=people,dc=example,dc=com").unwrap(),
		SearchScope::Subtree,
	);
	let mut sink = VecRecordSink::default();
	let exported = browser.export_records(&request, &mut sink, &cancel).await.unwrap();
	assert_eq!(exported, 4, "alice, bob, eve and the ou itself");
	assert_eq!(sink.records.len(), 4);
}

#[tokio::test]
async fn writes_emit_modification_log_records() {
	let stub = StubDirectory::with_example_tree();
	let log = CollectingLog::default();
	let browser = browser_over(&stub).with_modification_log(Arc::new(log.clone()));
	let cancel = CancellationToken::new();
	browser.open(&cancel).await.unwrap();

	let alice = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();
	browser.delete_entry(&alice, &cancel).await.unwrap();
	let missing = Dn::parse("cn=missing,dc=example,dc=com").unwrap();
	let _ = browser.delete_entry(&missing, &cancel).await;

	let records = log.0.lock().unwrap();
	assert_eq!(records.len(), 2, "one record per write, success or failure");
	assert!(records[0].success);
	assert_eq!(records[0].operation, OperationKind::Delete);
	assert!(!records[1].success);
	assert_eq!(records[1].result_code, 32);
}

#[tokio::test]
async fn close_clears_caches_and_keeps_parameters() {
	let (_stub, browser, cancel) = opened_browser().await;
	assert!(!browser.cache().is_empty());

	browser.close().await;
	assert_eq!(browser.state(), SessionState::Disconnected);
	assert!(browser.cache().is_empty());
	assert!(browser.schema().is_fallback());

	// parameters survive; the session reopens from scratch
	let report = browser.open(&cancel).await.unwrap();
	assert_eq!(report.base_dns.len(), 1);
	assert_eq!(browser.state(), SessionState::Bound);
}

/// End-to-end against a real server, e.g. the bitnami/openldap docker
/// image on localhost:1389.
#[ignore = "docker"]
#[tokio::test]
async fn live_server_bootstrap() -> Result<(), Box<dyn std::error::Error>> {
	let mut config = ConnectionConfig::new(Url::parse("ldap://localhost:1389")?);
	config.bind_principal = "cn=admin,dc=example,dc=org".to_owned();
	let browser = Browser::new(
		config,
		Arc::new(Ldap3Provider),
		Arc::new(StoredCredentials::new("cn=admin,dc=example,dc=org", "adminpassword")),
	);

	let cancel = CancellationToken::new();
	let report = browser.open(&cancel).await?;
	assert!(!report.base_dns.is_empty());

	for base in &report.base_dns {
		let children = browser.load_children(base, &cancel).await?;
		println!("{base}: {} children", children.len());
	}
	browser.close().await;
	Ok(())
}
