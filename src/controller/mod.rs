//! Reconciliation engine
//!
//! Watches parent custom resources and the kinds they own, drives each
//! parent's dependents through a dependency-ordered workflow, and records
//! the result as status conditions on the parent.

mod applier;
pub mod conditions;
mod dependent;
mod dispatcher;
mod executor;
mod gc;
mod kube_store;
mod memory_store;
#[cfg(feature = "metrics")]
pub mod metrics;
mod queue;
mod reconciler;
pub mod resources;
mod status;
mod store;
mod workflow;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod executor_test;
#[cfg(test)]
mod status_test;

pub use applier::{ApplyOutcome, DesiredStateApplier};
pub use conditions::{
    find_condition, is_condition_true, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_STATUS_UNKNOWN, CONDITION_TYPE_READY,
};
pub use dependent::{
    DependentResource, DesiredResource, ParentRef, Siblings, DEPENDENT_LABEL,
    LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL, OWNER_LABEL,
};
pub use dispatcher::EventDispatcher;
pub use executor::{DagExecutor, NodeResult, Outcome, PassReport};
pub use gc::GarbageCollector;
pub use kube_store::KubeStore;
pub use memory_store::{ExternalEdit, Fault, MemoryStore, StoreOp};
pub use queue::{Backoff, ReconcileRequest, WorkQueue};
pub use reconciler::{Controller, ParentResource, PassStatus};
pub use resources::review_cluster_workflow;
pub use status::{
    compute_conditions, invalid_spec_conditions, ObservedStatus, StatusAggregator, StatusWrite,
};
pub use store::{label_selector, ObjectKey, ObjectStore, WatchEvent};
pub use workflow::{DeletionPolicy, DependentNode, Workflow, WorkflowBuilder};
