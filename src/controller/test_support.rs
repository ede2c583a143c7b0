//! Shared fixtures for engine unit tests: a scriptable ConfigMap dependent
//! and helpers for seeding ReviewCluster parents into a [`MemoryStore`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ApiResource, DynamicObject, ObjectMeta};
use kube::ResourceExt;

use super::dependent::{DependentResource, DesiredResource, ParentRef, Siblings};
use super::gc::GarbageCollector;
use super::applier::DesiredStateApplier;
use super::memory_store::MemoryStore;
use super::queue::Backoff;
use super::store::{ObjectKey, ObjectStore};
use super::workflow::DependentNode;
use crate::crd::{ReviewCluster, ReviewClusterSpec};
use crate::error::Error;

pub const NAMESPACE: &str = "ns";

/// Every `desired` call: the node built and the sibling nodes it was given
pub type BuildLog = Arc<Mutex<Vec<(String, Vec<String>)>>>;

/// Runtime switches for one fake dependent
#[derive(Debug, Default)]
pub struct Switches {
    disabled: AtomicBool,
    failing: AtomicBool,
    value: Mutex<String>,
    builds: AtomicUsize,
}

impl Switches {
    pub fn disable(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_value(&self, value: &str) {
        *self.value.lock().unwrap() = value.to_string();
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

/// ConfigMap `{parent}-{node}` carrying `data.value`
pub struct FakeConfigMap {
    node: String,
    switches: Arc<Switches>,
    log: BuildLog,
}

impl DependentResource<ReviewCluster> for FakeConfigMap {
    fn api_resource(&self) -> ApiResource {
        config_maps()
    }

    fn precondition(&self, _parent: &ReviewCluster) -> crate::error::Result<bool> {
        Ok(!self.switches.disabled.load(Ordering::SeqCst))
    }

    fn desired(&self, parent: &ReviewCluster, siblings: &Siblings) -> crate::error::Result<DesiredResource> {
        self.switches.builds.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((
            self.node.clone(),
            siblings.nodes().map(str::to_string).collect(),
        ));
        if self.switches.failing.load(Ordering::SeqCst) {
            return Err(Error::BuilderError {
                node: self.node.clone(),
                message: "scripted failure".to_string(),
            });
        }

        let value = self.switches.value.lock().unwrap().clone();
        let mut data = BTreeMap::new();
        data.insert("value".to_string(), if value.is_empty() { "v1".to_string() } else { value });
        DesiredResource::from_typed(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name(&parent.name_any(), &self.node)),
                namespace: parent.namespace(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }
}

pub fn config_maps() -> ApiResource {
    ApiResource::erase::<ConfigMap>(&())
}

pub fn config_map_name(parent: &str, node: &str) -> String {
    format!("{}-{}", parent, node)
}

pub fn new_log() -> BuildLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Fake node plus the switches that drive it
pub fn fake(node: &str, log: &BuildLog) -> (DependentNode<ReviewCluster>, Arc<Switches>) {
    let switches = Arc::new(Switches::default());
    let resource = FakeConfigMap {
        node: node.to_string(),
        switches: Arc::clone(&switches),
        log: Arc::clone(log),
    };
    (DependentNode::new(node, resource), switches)
}

pub fn review_cluster(name: &str) -> ReviewCluster {
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
    rc
}

pub fn parent_ar() -> ApiResource {
    ApiResource::erase::<ReviewCluster>(&())
}

/// Store `rc` and return it as stored, with uid and generation assigned
pub async fn seed(store: &MemoryStore, rc: &ReviewCluster) -> ReviewCluster {
    let obj: DynamicObject = serde_json::from_value(serde_json::to_value(rc).unwrap()).unwrap();
    let created = store.create(&parent_ar(), &obj).await.unwrap();
    serde_json::from_value(serde_json::to_value(created).unwrap()).unwrap()
}

/// Replace the stored spec of `rc`, bumping its generation
pub async fn update_spec(store: &MemoryStore, rc: &ReviewCluster, spec: ReviewClusterSpec) -> ReviewCluster {
    let key = ObjectKey::namespaced(NAMESPACE, rc.name_any());
    let mut current = store.get(&parent_ar(), &key).await.unwrap().unwrap();
    current.data["spec"] = serde_json::to_value(spec).unwrap();
    let replaced = store.replace(&parent_ar(), &current).await.unwrap();
    serde_json::from_value(serde_json::to_value(replaced).unwrap()).unwrap()
}

pub fn parent_ref(rc: &ReviewCluster) -> ParentRef {
    let obj: DynamicObject = serde_json::from_value(serde_json::to_value(rc).unwrap()).unwrap();
    ParentRef::from_object(&parent_ar(), &obj)
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(100))
}

pub fn applier(store: Arc<dyn ObjectStore>) -> DesiredStateApplier {
    DesiredStateApplier::new(store, 3, "review-operator")
}

pub fn garbage_collector(store: Arc<dyn ObjectStore>) -> GarbageCollector {
    GarbageCollector::new(store, fast_backoff(), 3)
}

/// `data.value` of the fake ConfigMap for `node`, if it exists
pub fn stored_value(store: &MemoryStore, parent: &str, node: &str) -> Option<String> {
    store
        .peek(&config_maps(), &ObjectKey::namespaced(NAMESPACE, config_map_name(parent, node)))
        .and_then(|obj| obj.data["data"]["value"].as_str().map(str::to_string))
}
