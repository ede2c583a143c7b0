//! Dependent resource capability interface
//!
//! A dependent resource knows how to describe one managed object for a
//! parent: whether it should exist at all ([`DependentResource::precondition`])
//! and what it should look like ([`DependentResource::desired`]). Both are
//! pure functions of the parent spec (plus already reconciled siblings), so
//! the executor may call them as often as it likes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::store::ObjectKey;
use crate::error::Result;

/// Label naming the tool that manages an object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label naming the dependent node that produced an object
pub const DEPENDENT_LABEL: &str = "review.operator.dev/dependent";
/// Label naming the parent an object belongs to
pub const OWNER_LABEL: &str = "review.operator.dev/owner";
/// Annotation recording the owned fields written by the last apply
pub const LAST_APPLIED_ANNOTATION: &str = "review.operator.dev/last-applied";

/// Identity of the parent resource being reconciled
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    pub generation: Option<i64>,
}

impl ParentRef {
    pub fn from_object(ar: &ApiResource, obj: &DynamicObject) -> Self {
        Self {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
            namespace: obj.namespace(),
            name: obj.name_any(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
            generation: obj.metadata.generation,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref(), self.name.clone())
    }

    /// Controller owner reference used for cascading deletion
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether `obj` is controlled by this parent
    pub fn owns(&self, obj: &DynamicObject) -> bool {
        !self.uid.is_empty() && obj.owner_references().iter().any(|r| r.uid == self.uid)
    }
}

/// Desired state of one managed object, plus the fields its builder owns
#[derive(Clone, Debug)]
pub struct DesiredResource {
    pub api_resource: ApiResource,
    pub object: DynamicObject,
    /// JSON pointers (`/spec/replicas`) of the subtrees this builder owns
    pub owned_fields: Vec<String>,
}

impl DesiredResource {
    /// Wrap a dynamic object; owns every top-level field except status,
    /// plus labels and annotations
    pub fn new(api_resource: ApiResource, object: DynamicObject) -> Self {
        let owned_fields = default_owned_fields(&object);
        Self {
            api_resource,
            object,
            owned_fields,
        }
    }

    /// Build from a typed k8s-openapi object
    pub fn from_typed<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let api_resource = ApiResource::erase::<K>(&());
        let object: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        Ok(Self::new(api_resource, object))
    }

    /// Restrict ownership to the given JSON pointers
    pub fn owning<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owned_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }
}

fn default_owned_fields(object: &DynamicObject) -> Vec<String> {
    let mut fields = vec![
        "/metadata/labels".to_string(),
        "/metadata/annotations".to_string(),
    ];
    if let serde_json::Value::Object(map) = &object.data {
        fields.extend(
            map.keys()
                .filter(|k| !matches!(k.as_str(), "apiVersion" | "kind" | "metadata" | "status"))
                .map(|k| format!("/{}", escape_pointer_token(k))),
        );
    }
    fields
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Observed state of dependents that completed earlier in the same pass
#[derive(Clone, Debug, Default)]
pub struct Siblings {
    observed: BTreeMap<String, DynamicObject>,
}

impl Siblings {
    pub fn insert(&mut self, node: impl Into<String>, obj: DynamicObject) {
        self.observed.insert(node.into(), obj);
    }

    pub fn get(&self, node: &str) -> Option<&DynamicObject> {
        self.observed.get(node)
    }

    /// Observed sibling converted to a typed object
    pub fn get_as<K: DeserializeOwned>(&self, node: &str) -> Option<K> {
        let obj = self.observed.get(node)?;
        serde_json::to_value(obj)
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Names of the nodes present, in name order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.observed.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}

/// One kind of managed object produced for a parent of type `P`
pub trait DependentResource<P>: Send + Sync {
    /// Kind of the managed object
    fn api_resource(&self) -> ApiResource;

    /// Whether the managed object should exist for this parent
    fn precondition(&self, _parent: &P) -> Result<bool> {
        Ok(true)
    }

    /// Desired state of the managed object. `siblings` holds the observed
    /// objects of this node's `depends_on` predecessors.
    fn desired(&self, parent: &P, siblings: &Siblings) -> Result<DesiredResource>;
}
