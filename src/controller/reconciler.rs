//! Reconcile controller
//!
//! Ties the engine together: the dispatcher feeds parent identities into
//! the work queue, a fixed pool of workers checks keys out one at a time,
//! runs a full workflow pass per key and decides from the result whether
//! and when the key comes back.

use std::future::Future;
use std::sync::Arc;

use kube::api::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::applier::DesiredStateApplier;
use super::dependent::ParentRef;
use super::dispatcher::EventDispatcher;
use super::executor::{DagExecutor, PassReport};
use super::gc::GarbageCollector;
use super::queue::{ReconcileRequest, WorkQueue};
use super::status::{compute_conditions, invalid_spec_conditions, ObservedStatus, StatusAggregator, StatusWrite};
use super::store::{ObjectKey, ObjectStore};
use super::workflow::Workflow;
#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::OperatorConfig;
use crate::crd::Condition;
use crate::error::Result;

/// A custom resource kind the engine can reconcile
pub trait ParentResource:
    Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static
{
    /// Reject specs that cannot be reconciled; the message ends up in the
    /// `Ready` condition
    fn validate_spec(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// What one reconcile call did
#[derive(Clone, Debug)]
pub enum PassStatus {
    /// The workflow ran; errors, if any, are in the report
    Reconciled { report: PassReport, status: StatusWrite },
    /// The spec was rejected before any dependent was evaluated
    InvalidSpec { message: String, status: StatusWrite },
    /// The parent no longer exists
    ParentGone,
    /// The parent is being deleted; cascade deletion is the store's job
    Deleting,
}

/// Reconciles every parent of kind `P` through one workflow
pub struct Controller<P> {
    name: String,
    store: Arc<dyn ObjectStore>,
    parent: ApiResource,
    workflow: Workflow<P>,
    config: OperatorConfig,
    queue: Arc<WorkQueue<ObjectKey>>,
    applier: DesiredStateApplier,
    gc: GarbageCollector,
    status: StatusAggregator,
}

impl<P: ParentResource> Controller<P> {
    pub fn new(store: Arc<dyn ObjectStore>, workflow: Workflow<P>, config: OperatorConfig) -> Result<Self> {
        config.validate()?;
        let parent = ApiResource::erase::<P>(&());
        Ok(Self {
            name: parent.kind.to_lowercase(),
            queue: Arc::new(WorkQueue::new(config.backoff)),
            applier: DesiredStateApplier::new(
                Arc::clone(&store),
                config.conflict_retries,
                config.field_manager.clone(),
            ),
            gc: GarbageCollector::new(Arc::clone(&store), config.backoff, config.gc_attempts),
            status: StatusAggregator::new(Arc::clone(&store)),
            store,
            parent,
            workflow,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    pub fn workflow(&self) -> &Workflow<P> {
        &self.workflow
    }

    /// Run one full pass for the parent identified by `key`
    #[instrument(skip(self, key), fields(controller = %self.name, parent = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<PassStatus> {
        let Some(obj) = self.store.get(&self.parent, key).await? else {
            debug!("Parent no longer exists, dropping request");
            return Ok(PassStatus::ParentGone);
        };
        if obj.metadata.deletion_timestamp.is_some() {
            debug!("Parent is being deleted, skipping");
            return Ok(PassStatus::Deleting);
        }

        let owner = ParentRef::from_object(&self.parent, &obj);
        let previous = ObservedStatus::of(&obj);
        let generation = obj.metadata.generation;

        let parent: P = match serde_json::to_value(&obj).and_then(serde_json::from_value) {
            Ok(parent) => parent,
            Err(e) => {
                return self
                    .reject(key, &previous, generation, format!("cannot decode spec: {}", e))
                    .await
            }
        };
        if let Err(message) = parent.validate_spec() {
            return self.reject(key, &previous, generation, message).await;
        }

        debug!(generation = ?generation, "Running workflow {}", self.workflow.name());
        let report = DagExecutor::new(
            &self.workflow,
            &self.applier,
            &self.gc,
            self.config.max_concurrent_dependents,
        )
        .run(&parent, &owner)
        .await;

        #[cfg(feature = "metrics")]
        for result in &report.results {
            metrics::inc_dependent_outcome(&self.name, &result.node, result.outcome.label());
        }

        let conditions = compute_conditions(&self.workflow, &report, &previous.conditions, generation);
        let status = self.write_status(key, &previous, generation, conditions).await?;
        info!(outcome = report.worst().label(), status = status.label(), "Reconcile pass complete");
        Ok(PassStatus::Reconciled { report, status })
    }

    async fn reject(
        &self,
        key: &ObjectKey,
        previous: &ObservedStatus,
        generation: Option<i64>,
        message: String,
    ) -> Result<PassStatus> {
        warn!(%message, "Parent spec rejected");
        let conditions = invalid_spec_conditions(&previous.conditions, generation, &message);
        let status = self.write_status(key, previous, generation, conditions).await?;
        Ok(PassStatus::InvalidSpec { message, status })
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        previous: &ObservedStatus,
        generation: Option<i64>,
        conditions: Vec<Condition>,
    ) -> Result<StatusWrite> {
        let write = self
            .status
            .write(&self.parent, key, previous, generation, conditions)
            .await?;
        #[cfg(feature = "metrics")]
        metrics::inc_status_write(&self.name, write.label());
        Ok(write)
    }

    /// Reconcile a checked-out request and schedule what comes next for it
    pub async fn process(&self, request: ReconcileRequest<ObjectKey>) {
        let key = request.key;
        let started = std::time::Instant::now();
        let result = self.reconcile(&key).await;

        #[cfg(feature = "metrics")]
        metrics::observe_reconcile_duration_seconds(&self.name, started.elapsed().as_secs_f64());

        match result {
            Ok(PassStatus::Reconciled { report, .. }) if report.has_errors() => {
                let delay = self.queue.requeue_with_backoff(key.clone());
                warn!(
                    parent = %key,
                    failed = report.errors().count(),
                    retries = request.retries,
                    ?delay,
                    "Reconcile pass left dependents in error, requeueing"
                );
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(&self.name, "dependent");
            }
            Ok(PassStatus::Reconciled { .. }) | Ok(PassStatus::InvalidSpec { .. }) => {
                self.queue.forget(&key);
                if let Some(resync) = self.config.resync {
                    self.queue.enqueue_after(key.clone(), resync);
                }
            }
            Ok(PassStatus::ParentGone) | Ok(PassStatus::Deleting) => self.queue.forget(&key),
            Err(e) => {
                let delay = self.queue.requeue_with_backoff(key.clone());
                error!(parent = %key, error = %e, retriable = e.is_retriable(), ?delay, "Reconcile failed");
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(&self.name, e.kind());
            }
        }

        debug!(parent = %key, elapsed = ?started.elapsed(), "Request processed");
        self.queue.done(&key);
        #[cfg(feature = "metrics")]
        metrics::set_queue_depth(&self.name, self.queue.len());
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(controller = %self.name, worker = id, "Worker started");
        while let Some(request) = self.queue.dequeue().await {
            self.process(request).await;
        }
        debug!(controller = %self.name, worker = id, "Worker stopped");
    }

    /// Watch, reconcile and requeue until `shutdown` resolves, then stop
    /// handing out work and wait for in-flight passes to finish
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            controller = %self.name,
            workflow = self.workflow.name(),
            dependents = self.workflow.len(),
            workers = self.config.workers,
            "Starting controller"
        );

        let watchers = EventDispatcher::new(
            Arc::clone(&self.store),
            self.parent.clone(),
            self.workflow.managed_kinds(),
            self.config.namespace.clone(),
        )
        .managed_by(&self.config.field_manager)
        .spawn(self.queue());

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();

        shutdown.await;
        info!(controller = %self.name, "Shutdown requested, draining in-flight passes");
        self.queue.shutdown();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        for watcher in watchers {
            watcher.abort();
        }
        info!(controller = %self.name, "Controller stopped");
    }
}
