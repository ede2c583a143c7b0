//! Dependent resource DAG executor
//!
//! Walks a [`Workflow`] for one parent. A node starts only after every node
//! it depends on has finished; nodes with no path between them may run
//! concurrently, up to `max_concurrency` at a time. Failures and skips flow
//! down the graph: a node whose dependency failed is marked failed without
//! being evaluated, and a node whose dependency was skipped is skipped (and
//! its object garbage collected) as well. Independent branches always run.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use kube::api::DynamicObject;
use tracing::{debug, warn};

use super::applier::{ApplyOutcome, DesiredStateApplier};
use super::dependent::{ParentRef, Siblings};
use super::gc::GarbageCollector;
use super::workflow::{DeletionPolicy, DependentNode, Workflow};

/// Result of evaluating one node in a pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    /// Not applied because a precondition is not met; `cause` is the node
    /// whose own precondition failed (this node or an ancestor)
    Skipped { cause: String },
    /// Evaluation failed; `cause` is the node that actually failed
    Error { cause: String, message: String },
}

impl Outcome {
    /// Ordering used to pick the overall pass outcome
    pub fn severity(&self) -> u8 {
        match self {
            Outcome::Unchanged => 0,
            Outcome::Created | Outcome::Updated | Outcome::Skipped { .. } => 1,
            Outcome::Error { .. } => 2,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Error { .. } => "error",
        }
    }
}

impl From<ApplyOutcome> for Outcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Created => Outcome::Created,
            ApplyOutcome::Updated => Outcome::Updated,
            ApplyOutcome::Unchanged => Outcome::Unchanged,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Skipped { cause } => write!(f, "skipped ({} precondition not met)", cause),
            Outcome::Error { cause, message } => write!(f, "error in {}: {}", cause, message),
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeResult {
    pub node: String,
    pub outcome: Outcome,
}

/// Everything a reconcile pass produced, in completion order
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    pub results: Vec<NodeResult>,
}

impl PassReport {
    pub fn outcome(&self, node: &str) -> Option<&Outcome> {
        self.results
            .iter()
            .find(|r| r.node == node)
            .map(|r| &r.outcome)
    }

    /// The worst outcome of the pass; `Unchanged` for an empty workflow
    pub fn worst(&self) -> Outcome {
        self.results
            .iter()
            .map(|r| &r.outcome)
            .max_by_key(|o| o.severity())
            .cloned()
            .unwrap_or(Outcome::Unchanged)
    }

    pub fn errors(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.iter().filter(|r| r.outcome.is_error())
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Node names in the order they finished
    pub fn order(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.node.as_str()).collect()
    }
}

/// Work decided for a node once all its dependencies are done
enum Plan {
    /// Finished without any I/O
    Resolved(Outcome),
    /// Garbage collect, then report as skipped because of `cause`
    Withdraw { cause: String },
    /// Evaluate the precondition and apply
    Evaluate(Siblings),
}

type NodeFuture<'a> = BoxFuture<'a, (usize, Outcome, Option<DynamicObject>)>;

/// Executes a workflow for one parent
pub struct DagExecutor<'a, P> {
    workflow: &'a Workflow<P>,
    applier: &'a DesiredStateApplier,
    gc: &'a GarbageCollector,
    max_concurrency: usize,
}

impl<'a, P: Sync> DagExecutor<'a, P> {
    pub fn new(
        workflow: &'a Workflow<P>,
        applier: &'a DesiredStateApplier,
        gc: &'a GarbageCollector,
        max_concurrency: usize,
    ) -> Self {
        Self {
            workflow,
            applier,
            gc,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run one full pass over the workflow
    pub async fn run(&self, parent: &'a P, owner: &'a ParentRef) -> PassReport {
        let n = self.workflow.len();
        let mut remaining: Vec<usize> = (0..n).map(|i| self.workflow.deps_of(i).len()).collect();
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; n];
        let mut observed: HashMap<usize, DynamicObject> = HashMap::new();
        let mut in_flight: FuturesUnordered<NodeFuture<'a>> = FuturesUnordered::new();
        let mut report = PassReport::default();

        loop {
            while in_flight.len() < self.max_concurrency {
                let Some(idx) = ready.pop_front() else {
                    break;
                };
                match self.plan(idx, &outcomes, &observed) {
                    Plan::Resolved(outcome) => {
                        self.finish(
                            idx,
                            outcome,
                            None,
                            &mut outcomes,
                            &mut observed,
                            &mut remaining,
                            &mut ready,
                            &mut report,
                        );
                    }
                    Plan::Withdraw { cause } => {
                        in_flight.push(self.withdraw(idx, cause, owner));
                    }
                    Plan::Evaluate(siblings) => {
                        in_flight.push(self.evaluate(idx, parent, owner, siblings));
                    }
                }
            }

            match in_flight.next().await {
                Some((idx, outcome, obj)) => self.finish(
                    idx,
                    outcome,
                    obj,
                    &mut outcomes,
                    &mut observed,
                    &mut remaining,
                    &mut ready,
                    &mut report,
                ),
                None if ready.is_empty() => break,
                None => {}
            }
        }

        report
    }

    fn plan(
        &self,
        idx: usize,
        outcomes: &[Option<Outcome>],
        observed: &HashMap<usize, DynamicObject>,
    ) -> Plan {
        let node = &self.workflow.nodes()[idx];
        let deps = self.workflow.deps_of(idx);

        for &d in deps {
            if let Some(Outcome::Error { cause, .. }) = &outcomes[d] {
                return Plan::Resolved(Outcome::Error {
                    cause: cause.clone(),
                    message: format!(
                        "not evaluated: dependency {} failed",
                        self.workflow.nodes()[d].name()
                    ),
                });
            }
        }
        for &d in deps {
            if let Some(Outcome::Skipped { cause }) = &outcomes[d] {
                return if node.policy() == DeletionPolicy::Retain {
                    Plan::Resolved(Outcome::Skipped {
                        cause: cause.clone(),
                    })
                } else {
                    Plan::Withdraw {
                        cause: cause.clone(),
                    }
                };
            }
        }

        let mut siblings = Siblings::default();
        for &d in deps {
            if let Some(obj) = observed.get(&d) {
                siblings.insert(self.workflow.nodes()[d].name(), obj.clone());
            }
        }
        Plan::Evaluate(siblings)
    }

    fn withdraw(&self, idx: usize, cause: String, owner: &'a ParentRef) -> NodeFuture<'a> {
        let node: &'a DependentNode<P> = &self.workflow.nodes()[idx];
        let gc = self.gc;
        async move {
            let ar = node.resource().api_resource();
            match gc.reconcile_deletion(&ar, owner, node.name()).await {
                Ok(_) => (idx, Outcome::Skipped { cause }, None),
                Err(e) => (
                    idx,
                    Outcome::Error {
                        cause: node.name().to_string(),
                        message: format!("garbage collection failed: {}", e),
                    },
                    None,
                ),
            }
        }
        .boxed()
    }

    fn evaluate(
        &self,
        idx: usize,
        parent: &'a P,
        owner: &'a ParentRef,
        siblings: Siblings,
    ) -> NodeFuture<'a> {
        let node: &'a DependentNode<P> = &self.workflow.nodes()[idx];
        let applier = self.applier;
        let gc = self.gc;
        async move {
            let name = node.name();
            let failed = |message: String| Outcome::Error {
                cause: name.to_string(),
                message,
            };

            let met = match node.resource().precondition(parent) {
                Ok(met) => met,
                Err(e) => return (idx, failed(format!("precondition failed: {}", e)), None),
            };

            if !met {
                debug!(node = name, "Precondition not met");
                if node.policy() == DeletionPolicy::Delete {
                    let ar = node.resource().api_resource();
                    if let Err(e) = gc.reconcile_deletion(&ar, owner, name).await {
                        return (
                            idx,
                            failed(format!("garbage collection failed: {}", e)),
                            None,
                        );
                    }
                }
                return (
                    idx,
                    Outcome::Skipped {
                        cause: name.to_string(),
                    },
                    None,
                );
            }

            let desired = match node.resource().desired(parent, &siblings) {
                Ok(desired) => desired,
                Err(e) => return (idx, failed(e.to_string()), None),
            };

            match applier.apply(&desired, owner, name).await {
                Ok((obj, outcome)) => (idx, outcome.into(), Some(obj)),
                Err(e) => {
                    warn!(node = name, error = %e, "Failed to apply dependent");
                    (idx, failed(e.to_string()), None)
                }
            }
        }
        .boxed()
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        idx: usize,
        outcome: Outcome,
        obj: Option<DynamicObject>,
        outcomes: &mut [Option<Outcome>],
        observed: &mut HashMap<usize, DynamicObject>,
        remaining: &mut [usize],
        ready: &mut VecDeque<usize>,
        report: &mut PassReport,
    ) {
        let name = self.workflow.nodes()[idx].name();
        debug!(node = name, outcome = %outcome, "Dependent finished");

        if let Some(obj) = obj {
            observed.insert(idx, obj);
        }
        report.results.push(NodeResult {
            node: name.to_string(),
            outcome: outcome.clone(),
        });
        outcomes[idx] = Some(outcome);

        for &s in self.workflow.successors_of(idx) {
            remaining[s] -= 1;
            if remaining[s] == 0 {
                ready.push_back(s);
            }
        }
    }
}
