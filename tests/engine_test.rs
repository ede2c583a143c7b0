//! End-to-end tests of the reconciliation engine against the in-memory store
//!
//! Each test drives a [`Controller`] over a small workflow of ConfigMap
//! dependents whose precondition and content can be flipped at runtime,
//! then checks the store and the parent's status conditions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ApiResource, DynamicObject, ObjectMeta};
use kube::ResourceExt;
use review_operator::config::OperatorConfig;
use review_operator::controller::{
    find_condition, is_condition_true, Backoff, Controller, DependentNode, DependentResource,
    DesiredResource, Fault, MemoryStore, ObjectKey, ObjectStore, ObservedStatus, Outcome,
    PassStatus, Siblings, StatusWrite, StoreOp, Workflow, CONDITION_STATUS_FALSE,
    CONDITION_TYPE_READY,
};
use review_operator::crd::{ReviewCluster, ReviewClusterSpec};

const NAMESPACE: &str = "review";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Knobs {
    disabled: AtomicBool,
    value: Mutex<String>,
    builds: AtomicUsize,
}

/// ConfigMap `{parent}-{node}` whose existence and `data.value` are scripted
struct Toggle {
    node: &'static str,
    knobs: Arc<Knobs>,
}

impl DependentResource<ReviewCluster> for Toggle {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn precondition(&self, _parent: &ReviewCluster) -> review_operator::Result<bool> {
        Ok(!self.knobs.disabled.load(Ordering::SeqCst))
    }

    fn desired(
        &self,
        parent: &ReviewCluster,
        _siblings: &Siblings,
    ) -> review_operator::Result<DesiredResource> {
        self.knobs.builds.fetch_add(1, Ordering::SeqCst);
        let value = self.knobs.value.lock().unwrap().clone();
        let mut data = BTreeMap::new();
        data.insert(
            "value".to_string(),
            if value.is_empty() { "v1".to_string() } else { value },
        );
        DesiredResource::from_typed(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", parent.name_any(), self.node)),
                namespace: parent.namespace(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    controller: Arc<Controller<ReviewCluster>>,
    a: Arc<Knobs>,
    b: Arc<Knobs>,
}

/// Workflow `a <- b`, both required
fn harness() -> Harness {
    let a = Arc::new(Knobs::default());
    let b = Arc::new(Knobs::default());
    let workflow = Workflow::builder("a-b")
        .add(DependentNode::new(
            "a",
            Toggle {
                node: "a",
                knobs: Arc::clone(&a),
            },
        ))
        .add(
            DependentNode::new(
                "b",
                Toggle {
                    node: "b",
                    knobs: Arc::clone(&b),
                },
            )
            .depends_on(["a"]),
        )
        .build()
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let config = OperatorConfig {
        backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        resync: None,
        ..Default::default()
    };
    let controller = Arc::new(Controller::new(store.clone(), workflow, config).unwrap());
    Harness {
        store,
        controller,
        a,
        b,
    }
}

fn parent_ar() -> ApiResource {
    ApiResource::erase::<ReviewCluster>(&())
}

fn config_maps() -> ApiResource {
    ApiResource::erase::<ConfigMap>(&())
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced(NAMESPACE, name)
}

async fn seed_parent(store: &MemoryStore, name: &str) {
    let mut rc = ReviewCluster::new(
        name,
        ReviewClusterSpec {
            image: "review/server:3.9".to_string(),
            storage: Default::default(),
            primary: Default::default(),
            replica: None,
            ingress: Default::default(),
            maintenance: Default::default(),
        },
    );
    rc.metadata.namespace = Some(NAMESPACE.to_string());
    let obj: DynamicObject = serde_json::from_value(serde_json::to_value(&rc).unwrap()).unwrap();
    store.create(&parent_ar(), &obj).await.unwrap();
}

fn outcomes(status: &PassStatus) -> Vec<(String, Outcome)> {
    match status {
        PassStatus::Reconciled { report, .. } => report
            .results
            .iter()
            .map(|r| (r.node.clone(), r.outcome.clone()))
            .collect(),
        other => panic!("expected a reconciled pass, got {:?}", other),
    }
}

fn outcome_of(status: &PassStatus, node: &str) -> Outcome {
    outcomes(status)
        .into_iter()
        .find(|(n, _)| n == node)
        .map(|(_, o)| o)
        .unwrap()
}

fn parent_status(store: &MemoryStore, name: &str) -> ObservedStatus {
    ObservedStatus::of(&store.peek(&parent_ar(), &key(name)).unwrap())
}

fn config_map(store: &MemoryStore, name: &str) -> Option<DynamicObject> {
    store.peek(&config_maps(), &key(name))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_pass_creates_chain_and_disabling_root_skips_dependents() {
    let h = harness();
    seed_parent(&h.store, "rc").await;

    let first = h.controller.reconcile(&key("rc")).await.unwrap();
    assert_eq!(
        outcomes(&first),
        vec![
            ("a".to_string(), Outcome::Created),
            ("b".to_string(), Outcome::Created)
        ]
    );
    assert!(is_condition_true(
        &parent_status(&h.store, "rc").conditions,
        CONDITION_TYPE_READY
    ));

    h.a.disabled.store(true, Ordering::SeqCst);
    let second = h.controller.reconcile(&key("rc")).await.unwrap();
    assert_eq!(outcome_of(&second, "a"), Outcome::Skipped { cause: "a".to_string() });
    assert_eq!(outcome_of(&second, "b"), Outcome::Skipped { cause: "a".to_string() });
    assert!(config_map(&h.store, "rc-a").is_none());
    assert!(config_map(&h.store, "rc-b").is_none());

    let status = parent_status(&h.store, "rc");
    let ready = find_condition(&status.conditions, CONDITION_TYPE_READY).unwrap();
    assert_eq!(ready.status, CONDITION_STATUS_FALSE);
    assert!(ready.message.contains("dependent a"), "{}", ready.message);
}

#[tokio::test]
async fn disabled_dependent_stays_absent_until_reenabled() {
    let h = harness();
    seed_parent(&h.store, "rc").await;
    h.controller.reconcile(&key("rc")).await.unwrap();

    h.b.disabled.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        let pass = h.controller.reconcile(&key("rc")).await.unwrap();
        assert_eq!(outcome_of(&pass, "a"), Outcome::Unchanged);
        assert!(outcome_of(&pass, "b").is_skipped());
        assert!(config_map(&h.store, "rc-b").is_none());
    }
    assert_eq!(h.store.calls(StoreOp::Delete), 1);

    h.b.disabled.store(false, Ordering::SeqCst);
    let restored = h.controller.reconcile(&key("rc")).await.unwrap();
    assert_eq!(outcome_of(&restored, "a"), Outcome::Unchanged);
    assert_eq!(outcome_of(&restored, "b"), Outcome::Created);
    assert!(config_map(&h.store, "rc-b").is_some());
    assert!(is_condition_true(
        &parent_status(&h.store, "rc").conditions,
        CONDITION_TYPE_READY
    ));
}

#[tokio::test]
async fn repeated_passes_are_idempotent() {
    let h = harness();
    seed_parent(&h.store, "rc").await;
    h.controller.reconcile(&key("rc")).await.unwrap();
    let creates = h.store.calls(StoreOp::Create);

    let second = h.controller.reconcile(&key("rc")).await.unwrap();
    assert!(outcomes(&second).iter().all(|(_, o)| *o == Outcome::Unchanged));
    match second {
        PassStatus::Reconciled { status, .. } => assert_eq!(status, StatusWrite::Elided),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.store.calls(StoreOp::Create), creates);
    assert_eq!(h.store.calls(StoreOp::Replace), 0);
    assert_eq!(h.store.calls(StoreOp::PatchStatus), 1);
}

#[tokio::test]
async fn concurrent_edit_during_update_is_retried_without_losing_it() {
    let h = harness();
    seed_parent(&h.store, "rc").await;
    h.controller.reconcile(&key("rc")).await.unwrap();

    *h.a.value.lock().unwrap() = "v2".to_string();
    h.store.inject(
        StoreOp::Replace,
        Fault::ExternalEdit(Box::new(|obj: &mut DynamicObject| {
            obj.labels_mut()
                .insert("team".to_string(), "platform".to_string());
        })),
    );

    let pass = h.controller.reconcile(&key("rc")).await.unwrap();
    assert_eq!(outcome_of(&pass, "a"), Outcome::Updated);

    let stored = config_map(&h.store, "rc-a").unwrap();
    assert_eq!(stored.data["data"]["value"], "v2");
    assert_eq!(
        stored.labels().get("team").map(String::as_str),
        Some("platform")
    );
    assert_eq!(h.store.calls(StoreOp::Replace), 2);
}

#[tokio::test]
async fn foreign_fields_do_not_trigger_updates() {
    let h = harness();
    seed_parent(&h.store, "rc").await;
    h.controller.reconcile(&key("rc")).await.unwrap();

    let mut edited = config_map(&h.store, "rc-a").unwrap();
    edited.data["data"]["extra"] = serde_json::json!("from-someone-else");
    edited
        .annotations_mut()
        .insert("example.com/note".to_string(), "kept".to_string());
    h.store.replace(&config_maps(), &edited).await.unwrap();
    let replaces = h.store.calls(StoreOp::Replace);

    let pass = h.controller.reconcile(&key("rc")).await.unwrap();
    assert_eq!(outcome_of(&pass, "a"), Outcome::Unchanged);
    assert_eq!(h.store.calls(StoreOp::Replace), replaces);
    let stored = config_map(&h.store, "rc-a").unwrap();
    assert_eq!(stored.data["data"]["extra"], "from-someone-else");
}

#[tokio::test]
async fn burst_of_requests_collapses_into_one_pass_plus_follow_up() {
    let h = harness();
    seed_parent(&h.store, "rc").await;
    let queue = h.controller.queue();

    for _ in 0..50 {
        queue.enqueue(key("rc"));
    }
    assert_eq!(queue.len(), 1);

    let first = queue.dequeue().await.unwrap();
    // Events arriving while the pass is in flight leave one follow-up.
    for _ in 0..50 {
        queue.enqueue(key("rc"));
    }
    assert_eq!(queue.len(), 0);
    h.controller.process(first).await;
    assert_eq!(queue.len(), 1);

    let follow_up = queue.dequeue().await.unwrap();
    h.controller.process(follow_up).await;
    assert!(queue.is_empty());
    assert_eq!(h.a.builds.load(Ordering::SeqCst), 2);
    assert_eq!(h.b.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn review_cluster_workflow_reconciles_default_cluster() {
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::<ReviewCluster>::new(
        store.clone(),
        review_operator::controller::review_cluster_workflow().unwrap(),
        OperatorConfig {
            resync: None,
            ..Default::default()
        },
    )
    .unwrap();
    seed_parent(&store, "code").await;

    let pass = controller.reconcile(&key("code")).await.unwrap();
    let results = outcomes(&pass);
    assert!(results.iter().all(|(_, o)| !o.is_error()), "{:?}", results);

    let status = parent_status(&store, "code");
    assert!(is_condition_true(&status.conditions, CONDITION_TYPE_READY));
    assert!(is_condition_true(&status.conditions, "StorageReady"));
    assert!(is_condition_true(&status.conditions, "PrimaryReady"));

    let second = controller.reconcile(&key("code")).await.unwrap();
    assert!(outcomes(&second)
        .iter()
        .all(|(_, o)| *o == Outcome::Unchanged || o.is_skipped()));
}

#[tokio::test]
async fn run_reconciles_until_shutdown_then_drains() {
    let h = harness();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(Arc::clone(&h.controller).run(async {
        let _ = stopped.await;
    }));

    seed_parent(&h.store, "rc").await;
    let store = h.store.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while store.peek(&config_maps(), &key("rc-b")).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dependents should be created");

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller should stop")
        .unwrap();
    assert!(h.controller.queue().is_shutting_down());
    assert!(config_map(&h.store, "rc-a").is_some());
}
