//! Watch & event dispatcher
//!
//! Subscribes to the parent kind and every kind a workflow manages, and turns
//! each change into a reconcile request for the affected parent. Events carry
//! no payload into the queue: the reconciler always recomputes from current
//! state, so a burst of events for one parent coalesces into a single request.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::dependent::MANAGED_BY_LABEL;
use super::queue::WorkQueue;
use super::store::{label_selector, ObjectKey, ObjectStore, WatchEvent};

/// Maps watch events onto parent identities
pub struct EventDispatcher {
    store: Arc<dyn ObjectStore>,
    parent: ApiResource,
    managed: Vec<ApiResource>,
    namespace: Option<String>,
    /// Label selector applied to managed kinds
    managed_selector: Option<String>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        parent: ApiResource,
        managed: Vec<ApiResource>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            store,
            parent,
            managed,
            namespace,
            managed_selector: None,
        }
    }

    /// Only watch managed objects carrying this manager's managed-by label
    pub fn managed_by(mut self, manager: &str) -> Self {
        self.managed_selector = Some(label_selector(&[(MANAGED_BY_LABEL, manager)]));
        self
    }

    /// Parent affected by an event on the parent kind
    pub fn parent_key(event: &WatchEvent) -> Option<ObjectKey> {
        match event {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => {
                Some(ObjectKey::new(obj.namespace().as_deref(), obj.name_any()))
            }
            WatchEvent::Restarted => None,
        }
    }

    /// Parent affected by an event on a managed kind, resolved through the
    /// object's controller owner reference
    pub fn owner_key(parent: &ApiResource, event: &WatchEvent) -> Option<ObjectKey> {
        let obj: &DynamicObject = match event {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
            WatchEvent::Restarted => return None,
        };
        obj.owner_references()
            .iter()
            .find(|r| {
                r.controller == Some(true)
                    && r.kind == parent.kind
                    && r.api_version == parent.api_version
            })
            .map(|r| ObjectKey::new(obj.namespace().as_deref(), r.name.clone()))
    }

    /// Start one watch task per kind; every resolved parent is enqueued
    pub fn spawn(self, queue: Arc<WorkQueue<ObjectKey>>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.managed.len() + 1);

        let parent_stream = self.store.watch(&self.parent, self.namespace.as_deref(), None);
        handles.push(tokio::spawn(pump(
            self.parent.kind.clone(),
            parent_stream,
            Arc::clone(&queue),
            Self::parent_key,
        )));

        for ar in &self.managed {
            let stream = self.store.watch(
                ar,
                self.namespace.as_deref(),
                self.managed_selector.as_deref(),
            );
            let parent = self.parent.clone();
            handles.push(tokio::spawn(pump(
                ar.kind.clone(),
                stream,
                Arc::clone(&queue),
                move |event| Self::owner_key(&parent, event),
            )));
        }

        handles
    }
}

async fn pump<F>(
    kind: String,
    mut stream: futures::stream::BoxStream<'static, Result<WatchEvent, crate::error::StoreError>>,
    queue: Arc<WorkQueue<ObjectKey>>,
    resolve: F,
) where
    F: Fn(&WatchEvent) -> Option<ObjectKey> + Send + 'static,
{
    while let Some(event) = stream.next().await {
        match event {
            Ok(WatchEvent::Restarted) => debug!(%kind, "Watch (re)started"),
            Ok(event) => {
                if let Some(key) = resolve(&event) {
                    debug!(%kind, parent = %key, "Change observed, enqueueing parent");
                    queue.enqueue(key);
                }
            }
            Err(e) => warn!(%kind, error = %e, "Watch error"),
        }
    }
    debug!(%kind, "Watch stream ended");
}
