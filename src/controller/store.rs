//! Object store interface used by the reconciliation engine
//!
//! Every read and write the engine performs goes through [`ObjectStore`], so
//! the same engine runs against the API server ([`KubeStore`](super::KubeStore))
//! and against the in-process [`MemoryStore`](super::MemoryStore) in tests.
//! Objects are handled as [`DynamicObject`]s addressed by an [`ApiResource`]
//! plus an [`ObjectKey`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;

use crate::error::StoreError;

/// Namespace + name identity of one object of a known kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: &str, name: impl Into<String>) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of an existing object
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Change notification for one watched kind
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object created or modified (also emitted for every object on (re)list)
    Applied(DynamicObject),
    /// Object removed
    Deleted(DynamicObject),
    /// The watch was (re)established; consumers may have missed deletions
    Restarted,
}

/// Typed get/list/watch/create/replace/delete against the cluster API
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// List objects of a kind, optionally restricted to a namespace and an
    /// equality label selector (`k=v,k2=v2`)
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create a new object; `Conflict` when it already exists
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, StoreError>;

    /// Replace an object conditionally on `metadata.resourceVersion`;
    /// a stale version yields `Conflict`
    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Delete an object; `NotFound` when it is already gone
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), StoreError>;

    /// JSON merge patch of the status subresource
    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, StoreError>;

    /// Stream of change notifications for a kind, optionally narrowed to
    /// objects matching an equality label selector
    fn watch(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent, StoreError>>;
}

/// Parse an equality-based label selector into `(key, value)` pairs
pub fn parse_label_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|term| {
            let (k, v) = term.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Whether an object carries every label in the selector
pub fn matches_labels(obj: &DynamicObject, selector: &[(String, String)]) -> bool {
    let labels = obj.labels();
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

/// Render a label selector from pairs
pub fn label_selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
