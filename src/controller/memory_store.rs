//! In-process [`ObjectStore`] with API-server-like semantics
//!
//! Keeps objects in memory with monotonically increasing resource versions,
//! conditional replace, watch broadcast and owner-reference cascading
//! deletion. Failures and concurrent external edits can be scripted per
//! operation, which is how the engine's retry and conflict paths are tested.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::core::TypeMeta;
use kube::ResourceExt;
use tokio::sync::broadcast;

use super::store::{matches_labels, parse_label_selector, ObjectKey, ObjectStore, WatchEvent};
use crate::error::StoreError;

/// Store operation, used to script faults and count calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Replace,
    Delete,
    PatchStatus,
}

/// Edit applied to the stored object before an operation runs
pub type ExternalEdit = Box<dyn FnOnce(&mut DynamicObject) + Send>;

/// Scripted behaviour for the next call of an operation
pub enum Fault {
    /// Fail the call with the given error
    Fail(StoreError),
    /// Simulate a concurrent writer: mutate the stored object (bumping its
    /// resource version) and then let the call proceed
    ExternalEdit(ExternalEdit),
}

type StoredKey = (String, Option<String>, String);

struct Inner {
    objects: BTreeMap<StoredKey, DynamicObject>,
    next_version: u64,
    faults: HashMap<StoreOp, VecDeque<Fault>>,
    calls: HashMap<StoreOp, usize>,
}

/// In-memory object store
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<(String, WatchEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

fn stored_key(ar: &ApiResource, key: &ObjectKey) -> StoredKey {
    (kind_key(ar), key.namespace.clone(), key.name.clone())
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(serde_json::Map::new());
            }
            if let serde_json::Value::Object(target_map) = target {
                for (k, v) in patch_map {
                    if v.is_null() {
                        target_map.remove(k);
                    } else {
                        merge_patch(
                            target_map.entry(k.clone()).or_insert(serde_json::Value::Null),
                            v,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Spec-bearing content of an object, used to decide whether the generation moves
fn content_without_status(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let serde_json::Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                next_version: 1,
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a scripted fault for the next call of `op`
    pub fn inject(&self, op: StoreOp, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Convenience for `inject(op, Fault::Fail(err))`
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.inject(op, Fault::Fail(err));
    }

    /// Number of times `op` has been called
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Snapshot of every stored object of a kind
    pub fn objects(&self, ar: &ApiResource) -> Vec<DynamicObject> {
        let kind = kind_key(ar);
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Synchronous lookup for assertions
    pub fn peek(&self, ar: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(&stored_key(ar, key)).cloned()
    }

    fn bump(inner: &mut Inner) -> String {
        let version = inner.next_version;
        inner.next_version += 1;
        version.to_string()
    }

    /// Record the call and run any scripted fault; returns the error to surface
    fn enter(
        &self,
        op: StoreOp,
        target: Option<&StoredKey>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_insert(0) += 1;
        let fault = inner.faults.get_mut(&op).and_then(VecDeque::pop_front);
        match fault {
            None => Ok(()),
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::ExternalEdit(edit)) => {
                let edited = target.and_then(|key| {
                    let version = Self::bump(&mut inner);
                    let obj = inner.objects.get_mut(key)?;
                    edit(obj);
                    obj.metadata.resource_version = Some(version);
                    Some((key.0.clone(), obj.clone()))
                });
                drop(inner);
                if let Some((kind, obj)) = edited {
                    let _ = self.events.send((kind, WatchEvent::Applied(obj)));
                }
                Ok(())
            }
        }
    }

    fn publish(&self, kind: String, event: WatchEvent) {
        // No receivers is fine: nothing is watching yet.
        let _ = self.events.send((kind, event));
    }

    /// Remove an object and, transitively, everything it owns
    fn remove_cascading(&self, root: StoredKey) -> Vec<(String, DynamicObject)> {
        let mut inner = self.lock();
        let mut removed = Vec::new();
        let mut pending = vec![root];
        while let Some(key) = pending.pop() {
            let Some(obj) = inner.objects.remove(&key) else {
                continue;
            };
            if let Some(uid) = obj.metadata.uid.clone() {
                let owned: Vec<StoredKey> = inner
                    .objects
                    .iter()
                    .filter(|(_, o)| o.owner_references().iter().any(|r| r.uid == uid))
                    .map(|(k, _)| k.clone())
                    .collect();
                pending.extend(owned);
            }
            removed.push((key.0, obj));
        }
        removed
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let skey = stored_key(ar, key);
        self.enter(StoreOp::Get, Some(&skey))?;
        Ok(self.lock().objects.get(&skey).cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.enter(StoreOp::List, None)?;
        let selector = label_selector.map(parse_label_selector).unwrap_or_default();
        let kind = kind_key(ar);
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), obj)| {
                *k == kind
                    && namespace.map(|n| ns.as_deref() == Some(n)).unwrap_or(true)
                    && matches_labels(obj, &selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::new(obj.namespace().as_deref(), obj.name_any());
        let skey = stored_key(ar, &key);
        self.enter(StoreOp::Create, Some(&skey))?;

        let created = {
            let mut inner = self.lock();
            if inner.objects.contains_key(&skey) {
                return Err(StoreError::Conflict(format!("{} already exists", key)));
            }
            let version = Self::bump(&mut inner);
            let mut created = obj.clone();
            created.types = Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            });
            created.metadata.resource_version = Some(version.clone());
            created.metadata.generation = Some(1);
            if created.metadata.uid.is_none() {
                created.metadata.uid = Some(format!("uid-{}", version));
            }
            inner.objects.insert(skey.clone(), created.clone());
            created
        };
        self.publish(skey.0, WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::new(obj.namespace().as_deref(), obj.name_any());
        let skey = stored_key(ar, &key);
        self.enter(StoreOp::Replace, Some(&skey))?;

        let replaced = {
            let mut inner = self.lock();
            let current = inner
                .objects
                .get(&skey)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if obj.metadata.resource_version != current.metadata.resource_version {
                return Err(StoreError::Conflict(format!(
                    "{}: resource version {:?} is stale (current {:?})",
                    key, obj.metadata.resource_version, current.metadata.resource_version
                )));
            }
            let version = Self::bump(&mut inner);
            let mut replaced = obj.clone();
            replaced.types = current.types.clone();
            replaced.metadata.uid = current.metadata.uid.clone();
            replaced.metadata.resource_version = Some(version);
            let generation = current.metadata.generation.unwrap_or(1);
            replaced.metadata.generation =
                if content_without_status(&current) != content_without_status(&replaced) {
                    Some(generation + 1)
                } else {
                    Some(generation)
                };
            // Status lives in its own subresource.
            if let serde_json::Value::Object(map) = &mut replaced.data {
                map.remove("status");
                if let Some(status) = current.data.get("status") {
                    map.insert("status".to_string(), status.clone());
                }
            }
            inner.objects.insert(skey.clone(), replaced.clone());
            replaced
        };
        self.publish(skey.0, WatchEvent::Applied(replaced.clone()));
        Ok(replaced)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), StoreError> {
        let skey = stored_key(ar, key);
        self.enter(StoreOp::Delete, Some(&skey))?;
        let removed = self.remove_cascading(skey);
        if removed.is_empty() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        for (kind, obj) in removed {
            self.publish(kind, WatchEvent::Deleted(obj));
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, StoreError> {
        let skey = stored_key(ar, key);
        self.enter(StoreOp::PatchStatus, Some(&skey))?;

        let patched = {
            let mut inner = self.lock();
            let version = Self::bump(&mut inner);
            let obj = inner
                .objects
                .get_mut(&skey)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if !obj.data.is_object() {
                obj.data = serde_json::Value::Object(serde_json::Map::new());
            }
            if let serde_json::Value::Object(map) = &mut obj.data {
                merge_patch(
                    map.entry("status".to_string())
                        .or_insert(serde_json::Value::Null),
                    status,
                );
            }
            obj.metadata.resource_version = Some(version);
            obj.clone()
        };
        self.publish(skey.0, WatchEvent::Applied(patched.clone()));
        Ok(patched)
    }

    fn watch(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent, StoreError>> {
        let kind = kind_key(ar);
        let namespace = namespace.map(str::to_string);
        let selector = label_selector.map(parse_label_selector).unwrap_or_default();
        // Subscribe before taking the snapshot so nothing falls in between.
        let rx = self.events.subscribe();
        let snapshot: Vec<Result<WatchEvent, StoreError>> = std::iter::once(Ok(WatchEvent::Restarted))
            .chain(
                self.lock()
                    .objects
                    .iter()
                    .filter(|((k, ns, _), obj)| {
                        *k == kind
                            && (namespace.is_none() || *ns == namespace)
                            && matches_labels(obj, &selector)
                    })
                    .map(|(_, obj)| Ok(WatchEvent::Applied(obj.clone()))),
            )
            .collect();

        let live = stream::unfold(rx, move |mut rx| {
            let kind = kind.clone();
            let namespace = namespace.clone();
            let selector = selector.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((event_kind, event)) => {
                            let in_scope = event_kind == kind
                                && match &event {
                                    WatchEvent::Applied(o) | WatchEvent::Deleted(o) => {
                                        namespace
                                            .as_deref()
                                            .map(|ns| o.namespace().as_deref() == Some(ns))
                                            .unwrap_or(true)
                                            && matches_labels(o, &selector)
                                    }
                                    WatchEvent::Restarted => true,
                                };
                            if in_scope {
                                return Some((Ok(event), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            return Some((Ok(WatchEvent::Restarted), rx));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(snapshot).chain(live).boxed()
    }
}
