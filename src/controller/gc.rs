//! Garbage collection of withdrawn dependents
//!
//! When a node's precondition stops holding, whatever it previously created
//! for the parent has to go. Objects are found by the dependent and owner
//! labels the applier stamps, then confirmed by the parent's UID in their
//! owner references so that a same-named parent recreated in the meantime
//! never loses objects it owns.

use std::sync::Arc;

use kube::api::ApiResource;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::dependent::{ParentRef, DEPENDENT_LABEL, OWNER_LABEL};
use super::queue::Backoff;
use super::store::{label_selector, ObjectKey, ObjectStore};
use crate::error::{Result, StoreError};

pub struct GarbageCollector {
    store: Arc<dyn ObjectStore>,
    backoff: Backoff,
    attempts: u32,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn ObjectStore>, backoff: Backoff, attempts: u32) -> Self {
        Self {
            store,
            backoff,
            attempts: attempts.max(1),
        }
    }

    /// Delete every object `node` manages for `parent`; returns how many
    /// were removed. Objects already gone count as success.
    #[instrument(skip(self, ar, parent), fields(kind = %ar.kind, parent = %parent.name))]
    pub async fn reconcile_deletion(
        &self,
        ar: &ApiResource,
        parent: &ParentRef,
        node: &str,
    ) -> Result<usize> {
        let selector = label_selector(&[(DEPENDENT_LABEL, node), (OWNER_LABEL, &parent.name)]);
        let candidates = self
            .retrying(|| self.store.list(ar, parent.namespace.as_deref(), Some(&selector)))
            .await?;

        let mut deleted = 0;
        for obj in candidates.iter().filter(|o| parent.owns(o)) {
            let key = ObjectKey::new(obj.namespace().as_deref(), obj.name_any());
            match self.retrying(|| self.store.delete(ar, &key)).await {
                Ok(()) => {
                    info!(kind = %ar.kind, object = %key, node, "Deleted withdrawn dependent");
                    deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(error = %e, attempt, ?delay, "Transient error during garbage collection");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
