//! End-to-end reconciliation scenarios driven entirely through the wire
//! protocol's request/response surface, against an in-memory store and
//! in-memory (or shell) drivers.

use std::sync::Arc;

use serde_json::json;

use reconciler::dispatcher::Dispatcher;
use reconciler::driver::{AnyDriver, DriverRegistry};
use reconciler::drivers::memory::MemoryDriver;
use reconciler::drivers::shell::ShellDriver;
use reconciler::reconciler::Reconciler;
use reconciler::server::handle_request;
use reconciler::store::{InMemoryStore, WorkItem};
use reconciler::wire::{ChangeNotification, Request, Response};
use reconciler_core::document::{Document, Path};
use reconciler_core::key::{ForeignKey, InternalKey};
use reconciler_core::merge::RejectOnDisagreement;

fn tier(doc: &Document) -> Option<&str> {
    doc.get(&Path::parse("tier").unwrap())
}

fn name(doc: &Document) -> Option<&str> {
    doc.get(&Path::parse("name").unwrap())
}

struct Harness {
    store: Arc<InMemoryStore>,
    reconciler: Arc<Reconciler<InMemoryStore>>,
    dispatcher: Arc<Dispatcher<InMemoryStore>>,
}

impl Harness {
    fn new(registry: DriverRegistry) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::new(registry),
            Box::new(RejectOnDisagreement),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), Arc::clone(&reconciler), 4, 8));
        Self { store, reconciler, dispatcher }
    }

    async fn request(&self, request: Request) -> Response {
        handle_request(request, &self.store, &self.reconciler, &self.dispatcher).await
    }
}

/// Scenario 1: single-source first contact. Register entity "customer",
/// source {"acct"}; `acct.A1 = {"name":"Alice"}`. Notify. Expect a new
/// internal key, baseline `{"name":"Alice"}`, no notifications, and
/// `driver.set` called once.
#[tokio::test]
async fn scenario_1_single_source_first_contact() {
    let acct = MemoryDriver::new();
    let mut registry = DriverRegistry::new();
    registry.insert("customer", "acct", AnyDriver::Memory(acct.clone()));
    let harness = Harness::new(registry);

    acct.seed(
        &ForeignKey::new("customer", "acct", "A1").unwrap(),
        Document::from_json(&json!({"name": "Alice"})).unwrap(),
    )
    .await;

    let response = harness
        .request(Request::Notify(ChangeNotification {
            entity: "customer".to_owned(),
            source: "acct".to_owned(),
            foreign_id: "A1".to_owned(),
        }))
        .await;
    assert_eq!(response, Response::NotifyOk);

    let fk = ForeignKey::new("customer", "acct", "A1").unwrap();
    let key = harness.store.internal_key_for(&fk).await.expect("ik minted on first contact");
    let baseline = harness.store.baseline(&key).await.expect("baseline recorded");
    assert_eq!(name(&baseline), Some("Alice"));
    assert_eq!(harness.store.fetch_notifications(10).await, (0, Vec::new()));

    // `set` (create, since acct had nothing registered under the driver's
    // own write path) was issued exactly once: the seeded document already
    // equals the resolved baseline.
    let stored = acct.read(&fk).await.unwrap().unwrap();
    assert_eq!(name(&stored), Some("Alice"));
}

/// Scenario 2: two sources agree. Both report the same Document; expect a
/// clean automerge with zero rejected operations and both drivers written.
#[tokio::test]
async fn scenario_2_two_sources_agree() {
    let acct = MemoryDriver::new();
    let users = MemoryDriver::new();
    let mut registry = DriverRegistry::new();
    registry.insert("customer", "acct", AnyDriver::Memory(acct.clone()));
    registry.insert("customer", "users", AnyDriver::Memory(users.clone()));
    let harness = Harness::new(registry);

    let key = InternalKey::new("customer", "1").unwrap();
    harness.store.link(key.clone(), ForeignKey::new("customer", "acct", "A1").unwrap()).await;
    harness.store.link(key.clone(), ForeignKey::new("customer", "users", "U1").unwrap()).await;
    let agreed = Document::from_json(&json!({"name": "Alice", "tier": "gold"})).unwrap();
    acct.seed(&ForeignKey::new("customer", "acct", "A1").unwrap(), agreed.clone()).await;
    users.seed(&ForeignKey::new("customer", "users", "U1").unwrap(), agreed.clone()).await;

    let outcome = harness.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome.conflict_count, 0);

    let baseline = harness.store.baseline(&key).await.unwrap();
    assert_eq!(name(&baseline), Some("Alice"));
    assert_eq!(tier(&baseline), Some("gold"));
    assert!(harness.store.list_conflicts(&key).await.is_empty());

    let acct_doc = acct.read(&ForeignKey::new("customer", "acct", "A1").unwrap()).await.unwrap().unwrap();
    let users_doc = users.read(&ForeignKey::new("customer", "users", "U1").unwrap()).await.unwrap().unwrap();
    assert_eq!(acct_doc, baseline);
    assert_eq!(users_doc, baseline);
}

/// Scenario 3: conflict on one path. `acct` proposes `tier=gold`, `users`
/// proposes `tier=silver`; `name` agrees. Expect `applied` to carry only
/// `name`, both `tier` operations rejected, baseline advanced to
/// `{"name":"Alice"}`, and exactly one Notification persisted.
#[tokio::test]
async fn scenario_3_conflict_on_one_path() {
    let acct = MemoryDriver::new();
    let users = MemoryDriver::new();
    let mut registry = DriverRegistry::new();
    registry.insert("customer", "acct", AnyDriver::Memory(acct.clone()));
    registry.insert("customer", "users", AnyDriver::Memory(users.clone()));
    let harness = Harness::new(registry);

    let key = InternalKey::new("customer", "1").unwrap();
    harness.store.link(key.clone(), ForeignKey::new("customer", "acct", "A1").unwrap()).await;
    harness.store.link(key.clone(), ForeignKey::new("customer", "users", "U1").unwrap()).await;
    acct.seed(
        &ForeignKey::new("customer", "acct", "A1").unwrap(),
        Document::from_json(&json!({"name": "Alice", "tier": "gold"})).unwrap(),
    )
    .await;
    users.seed(
        &ForeignKey::new("customer", "users", "U1").unwrap(),
        Document::from_json(&json!({"name": "Alice", "tier": "silver"})).unwrap(),
    )
    .await;

    let outcome = harness.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome.applied_count, 1);
    assert_eq!(outcome.conflict_count, 2);

    let baseline = harness.store.baseline(&key).await.unwrap();
    assert_eq!(name(&baseline), Some("Alice"));
    assert_eq!(tier(&baseline), None);

    let conflicts = harness.store.list_conflicts(&key).await;
    assert_eq!(conflicts.len(), 2);
    let values: Vec<Option<&str>> = conflicts.iter().map(|c| c.operation.final_value()).collect();
    assert!(values.contains(&Some("gold")));
    assert!(values.contains(&Some("silver")));

    let (remaining, notifications) = harness.store.fetch_notifications(10).await;
    assert_eq!(remaining, 0);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].key, key);
}

/// Scenario 4: ListConflicts + Resolve, continuing scenario 3's setup.
/// Resolving the "silver" operation should advance the baseline to
/// `tier=silver`, clear ListConflicts, and write the resolved Document to
/// both sources.
#[tokio::test]
async fn scenario_4_list_conflicts_then_resolve() {
    let acct = MemoryDriver::new();
    let users = MemoryDriver::new();
    let mut registry = DriverRegistry::new();
    registry.insert("customer", "acct", AnyDriver::Memory(acct.clone()));
    registry.insert("customer", "users", AnyDriver::Memory(users.clone()));
    let harness = Harness::new(registry);

    let key = InternalKey::new("customer", "1").unwrap();
    harness.store.link(key.clone(), ForeignKey::new("customer", "acct", "A1").unwrap()).await;
    harness.store.link(key.clone(), ForeignKey::new("customer", "users", "U1").unwrap()).await;
    acct.seed(
        &ForeignKey::new("customer", "acct", "A1").unwrap(),
        Document::from_json(&json!({"name": "Alice", "tier": "gold"})).unwrap(),
    )
    .await;
    users.seed(
        &ForeignKey::new("customer", "users", "U1").unwrap(),
        Document::from_json(&json!({"name": "Alice", "tier": "silver"})).unwrap(),
    )
    .await;
    harness.reconciler.reconcile(&key).await.unwrap();

    let Response::ListConflicts(entries) = harness.request(Request::ListConflicts).await else {
        panic!("expected ListConflicts response");
    };
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    let diff_id = entry.diff_id;
    let silver_op = entry
        .rejected
        .iter()
        .find(|(_, op)| op.final_value() == Some("silver"))
        .map(|(id, _)| *id)
        .expect("silver operation present among rejected");

    let resolve_response = harness
        .request(Request::Resolve { diff_id, operation_ids: vec![silver_op] })
        .await;
    assert_eq!(resolve_response, Response::ResolveOk);

    let baseline = harness.store.baseline(&key).await.unwrap();
    assert_eq!(tier(&baseline), Some("silver"));

    let remaining = harness.request(Request::ListConflicts).await;
    assert_eq!(remaining, Response::ListConflicts(Vec::new()));

    let acct_doc = acct.read(&ForeignKey::new("customer", "acct", "A1").unwrap()).await.unwrap().unwrap();
    let users_doc = users.read(&ForeignKey::new("customer", "users", "U1").unwrap()).await.unwrap().unwrap();
    assert_eq!(tier(&acct_doc), Some("silver"));
    assert_eq!(tier(&users_doc), Some("silver"));
}

/// Scenario 5: transient failure + retry. `acct`'s read fails twice
/// (`Unavailable`) then succeeds; the dispatcher retries with backoff and
/// the baseline eventually advances, with no spurious notifications.
#[tokio::test]
async fn scenario_5_transient_failure_then_retry_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let counter_path = dir.path().join("attempts");
    let read_cmd = format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}; \
         if [ \"$n\" -le 2 ]; then exit 7; else echo '{{\"name\":\"Alice\"}}'; fi",
        counter = counter_path.display(),
    );

    let acct_source_config = reconciler::config::SourceConfig {
        create: "cat > /dev/null && echo '{}'".to_owned(),
        read: read_cmd,
        update: "cat".to_owned(),
        delete: "true".to_owned(),
    };
    let acct = ShellDriver::new("acct".to_owned(), acct_source_config);

    let mut registry = DriverRegistry::new();
    registry.insert("customer", "acct", AnyDriver::Shell(acct));
    let harness = Harness::new(registry);

    let key = InternalKey::new("customer", "1").unwrap();
    harness.store.link(key.clone(), ForeignKey::new("customer", "acct", "A1").unwrap()).await;

    harness.dispatcher.notify(WorkItem { key: key.clone(), source: "acct".to_owned() }).await;
    let summary = harness.dispatcher.flush_work_queue().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let baseline = harness.store.baseline(&key).await.expect("baseline eventually advances");
    assert_eq!(name(&baseline), Some("Alice"));
    assert_eq!(harness.store.fetch_notifications(10).await, (0, Vec::new()));
}

/// Scenario 6: flush of 25 notifications. `FlushWorkQueue` drains every
/// queued item and reports the count processed; `diff_records` totals
/// match.
#[tokio::test]
async fn scenario_6_flush_of_25_notifications() {
    let mut registry = DriverRegistry::new();
    let mut keys = Vec::new();
    for i in 0..25 {
        let key = InternalKey::new("customer", i.to_string()).unwrap();
        let source = format!("crm{i}");
        let fk = ForeignKey::new("customer", source.clone(), format!("cust_{i}")).unwrap();
        let driver = MemoryDriver::new();
        driver.seed(&fk, Document::from_json(&json!({"tier": "gold"})).unwrap()).await;
        registry.insert("customer", source.clone(), AnyDriver::Memory(driver));
        keys.push((key, source, fk));
    }
    let harness = Harness::new(registry);
    for (key, source, fk) in &keys {
        harness.store.link(key.clone(), fk.clone()).await;
        harness.dispatcher.notify(WorkItem { key: key.clone(), source: source.clone() }).await;
    }

    let response = harness.request(Request::FlushWorkQueue).await;
    assert_eq!(response, Response::FlushWorkQueue(25));

    let mut total_diff_records = 0;
    for (key, _, _) in &keys {
        total_diff_records += harness.store.diff_records(key).await.len();
    }
    assert_eq!(total_diff_records, 25);
}
