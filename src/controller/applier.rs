//! Desired-state applier
//!
//! Brings one managed object in line with its [`DesiredResource`]. Only the
//! subtrees the builder owns are compared and written; everything else on
//! the live object (fields set by other controllers, defaulted fields,
//! status) is carried over untouched. The owned fields written by each
//! apply are recorded in an annotation, so keys the builder stops producing
//! are removed on the next apply instead of lingering. Writes are
//! conditional on the observed resource version, and a conflicting write is
//! retried from a fresh read up to a bounded number of attempts.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::dependent::{
    DesiredResource, ParentRef, DEPENDENT_LABEL, LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL,
    OWNER_LABEL,
};
use super::store::{ObjectKey, ObjectStore};
use crate::error::{Error, Result};

/// What a single apply did to the live object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Applies desired state through an [`ObjectStore`]
pub struct DesiredStateApplier {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    /// Written as the managed-by label
    manager: String,
}

impl DesiredStateApplier {
    pub fn new(store: Arc<dyn ObjectStore>, max_attempts: u32, manager: impl Into<String>) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            manager: manager.into(),
        }
    }

    /// Create or update the object described by `desired` on behalf of
    /// `parent`, returning the object as stored afterwards
    #[instrument(skip_all, fields(node = %node, kind = %desired.api_resource.kind, name = %desired.name()))]
    pub async fn apply(
        &self,
        desired: &DesiredResource,
        parent: &ParentRef,
        node: &str,
    ) -> Result<(DynamicObject, ApplyOutcome)> {
        let ar = &desired.api_resource;
        let mut target = stamp(desired, parent, node, &self.manager);
        let applied = applied_fields(&serde_json::to_value(&target)?, &desired.owned_fields);
        target.annotations_mut().insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            Value::Object(applied.clone()).to_string(),
        );
        let key = ObjectKey::new(target.namespace().as_deref(), target.name_any());
        let desired_json = serde_json::to_value(&target)?;

        for attempt in 1..=self.max_attempts {
            let Some(observed) = self.store.get(ar, &key).await? else {
                match self.store.create(ar, &target).await {
                    Ok(created) => {
                        info!(kind = %ar.kind, object = %key, node, "Created dependent");
                        return Ok((created, ApplyOutcome::Created));
                    }
                    Err(e) if e.is_conflict() => {
                        warn!(kind = %ar.kind, object = %key, attempt, "Object appeared during create, retrying");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let mut live = serde_json::to_value(&observed)?;
            let stale: Vec<String> =
                dropped_fields(&last_applied(&live), &applied, &desired.owned_fields)
                    .into_iter()
                    .filter(|p| live.pointer(p).is_some())
                    .collect();
            if stale.is_empty()
                && is_up_to_date(&live, &desired_json, &desired.owned_fields, parent)
            {
                debug!(kind = %ar.kind, object = %key, node, "Dependent up to date");
                return Ok((observed, ApplyOutcome::Unchanged));
            }

            merge_owned(&mut live, &desired_json, &desired.owned_fields, parent);
            for pointer in &stale {
                remove_pointer(&mut live, pointer);
            }
            if !stale.is_empty() {
                debug!(kind = %ar.kind, object = %key, removed = ?stale, "Pruning fields no longer desired");
            }
            let updated: DynamicObject = serde_json::from_value(live)?;
            match self.store.replace(ar, &updated).await {
                Ok(replaced) => {
                    info!(kind = %ar.kind, object = %key, node, "Updated dependent");
                    return Ok((replaced, ApplyOutcome::Updated));
                }
                Err(e) if e.is_conflict() => {
                    warn!(kind = %ar.kind, object = %key, attempt, "Write conflict, refetching");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ConflictRetriesExhausted {
            resource: format!("{} {}", ar.kind, key),
            attempts: self.max_attempts,
        })
    }
}

/// Desired object with ownership metadata and namespace filled in
fn stamp(desired: &DesiredResource, parent: &ParentRef, node: &str, manager: &str) -> DynamicObject {
    let mut obj = desired.object.clone();
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = parent.namespace.clone();
    }
    obj.metadata.resource_version = None;

    let labels = obj.labels_mut();
    labels.insert(MANAGED_BY_LABEL.to_string(), manager.to_string());
    labels.insert(DEPENDENT_LABEL.to_string(), node.to_string());
    labels.insert(OWNER_LABEL.to_string(), parent.name.clone());

    let owners = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    owners.retain(|r| r.uid != parent.uid);
    owners.push(parent.owner_reference());
    obj
}

/// Pointers that are compared and written on every apply, whatever the
/// builder claims to own
fn ownership_pointers() -> [String; 4] {
    [
        format!("/metadata/labels/{}", escape(MANAGED_BY_LABEL)),
        format!("/metadata/labels/{}", escape(DEPENDENT_LABEL)),
        format!("/metadata/labels/{}", escape(OWNER_LABEL)),
        format!("/metadata/annotations/{}", escape(LAST_APPLIED_ANNOTATION)),
    ]
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Owned subtrees of `desired`, keyed by pointer
fn applied_fields(desired: &Value, owned: &[String]) -> Map<String, Value> {
    owned
        .iter()
        .filter_map(|p| desired.pointer(p).map(|v| (p.clone(), v.clone())))
        .collect()
}

/// Owned subtrees recorded by the previous apply; empty when the object
/// was never applied or the record is unreadable
fn last_applied(live: &Value) -> Map<String, Value> {
    live.pointer(&format!("/metadata/annotations/{}", escape(LAST_APPLIED_ANNOTATION)))
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Pointers of keys the previous apply wrote under an owned pointer that
/// the current desired state no longer has. An owned pointer that vanished
/// entirely is cleared key by key so foreign keys next to ours survive.
pub fn dropped_fields(
    previous: &Map<String, Value>,
    current: &Map<String, Value>,
    owned: &[String],
) -> Vec<String> {
    let mut dropped = Vec::new();
    for pointer in owned {
        let Some(before) = previous.get(pointer) else {
            continue;
        };
        match (before, current.get(pointer)) {
            (before, Some(now)) => collect_dropped(before, now, pointer, &mut dropped),
            (Value::Object(keys), None) => dropped.extend(
                keys.keys().map(|k| format!("{}/{}", pointer, escape(k))),
            ),
            (_, None) => dropped.push(pointer.clone()),
        }
    }
    dropped
}

fn collect_dropped(before: &Value, now: &Value, at: &str, dropped: &mut Vec<String>) {
    match (before, now) {
        (Value::Object(b), Value::Object(n)) => {
            for (k, bv) in b {
                let child = format!("{}/{}", at, escape(k));
                match n.get(k) {
                    Some(nv) => collect_dropped(bv, nv, &child, dropped),
                    None => dropped.push(child),
                }
            }
        }
        // Resized arrays are replaced wholesale by the merge.
        (Value::Array(b), Value::Array(n)) if b.len() == n.len() => {
            for (i, (bv, nv)) in b.iter().zip(n).enumerate() {
                collect_dropped(bv, nv, &format!("{}/{}", at, i), dropped);
            }
        }
        _ => {}
    }
}

/// Remove the object key a pointer ends in, if present
fn remove_pointer(root: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    if let Some(Value::Object(map)) = root.pointer_mut(parent) {
        map.remove(&unescape(last));
    }
}

fn has_owner(live: &Value, parent: &ParentRef) -> bool {
    live.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(parent.uid.as_str()))
        })
        .unwrap_or(false)
}

/// Whether every owned subtree of `desired` is already present in `live`
pub fn is_up_to_date(live: &Value, desired: &Value, owned: &[String], parent: &ParentRef) -> bool {
    let stamped = ownership_pointers();
    has_owner(live, parent)
        && owned.iter().chain(stamped.iter()).all(|p| match desired.pointer(p) {
            Some(want) => live.pointer(p).map(|have| contains(have, want)).unwrap_or(want.is_null()),
            None => true,
        })
}

/// Whether `have` holds everything `want` specifies. Objects may carry
/// extra keys; arrays must match in length and element-wise.
pub fn contains(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(h), Value::Object(w)) => w.iter().all(|(k, wv)| match h.get(k) {
            Some(hv) => contains(hv, wv),
            None => wv.is_null(),
        }),
        (Value::Array(h), Value::Array(w)) => {
            h.len() == w.len() && h.iter().zip(w).all(|(hv, wv)| contains(hv, wv))
        }
        (h, w) => h == w,
    }
}

/// Write each owned subtree of `desired` into `live`
fn merge_owned(live: &mut Value, desired: &Value, owned: &[String], parent: &ParentRef) {
    for pointer in owned.iter().chain(ownership_pointers().iter()) {
        if let Some(want) = desired.pointer(pointer) {
            match live.pointer_mut(pointer) {
                Some(have) => merge(have, want),
                None => set_pointer(live, pointer, want.clone()),
            }
        }
    }

    if !has_owner(live, parent) {
        if let Ok(owner) = serde_json::to_value(parent.owner_reference()) {
            match live.pointer_mut("/metadata/ownerReferences") {
                Some(Value::Array(refs)) => refs.push(owner),
                _ => set_pointer(live, "/metadata/ownerReferences", Value::Array(vec![owner])),
            }
        }
    }
}

/// Deep merge: objects key by key, equal-length arrays element-wise,
/// anything else replaced
pub fn merge(have: &mut Value, want: &Value) {
    match (have, want) {
        (Value::Object(h), Value::Object(w)) => {
            for (k, wv) in w {
                match h.get_mut(k) {
                    Some(hv) => merge(hv, wv),
                    None => {
                        h.insert(k.clone(), wv.clone());
                    }
                }
            }
        }
        (Value::Array(h), Value::Array(w)) if h.len() == w.len() => {
            for (hv, wv) in h.iter_mut().zip(w) {
                merge(hv, wv);
            }
        }
        (h, w) => *h = w.clone(),
    }
}

/// Set the value at a JSON pointer, creating intermediate objects
fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(unescape)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for token in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map.entry(token.clone()).or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}
