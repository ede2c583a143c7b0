//! Status aggregation
//!
//! Turns the node outcomes of one completed pass into the parent's status
//! conditions: one condition per condition group declared in the workflow,
//! plus the overall `Ready` condition. The whole status is written with a
//! single patch, and the write is skipped entirely when the parent already
//! shows the same conditions for its current generation.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::api::{ApiResource, DynamicObject};
use serde::Deserialize;
use tracing::debug;

use super::conditions::*;
use super::executor::{Outcome, PassReport};
use super::store::{ObjectKey, ObjectStore};
use super::workflow::Workflow;
use crate::crd::Condition;
use crate::error::Result;

/// The part of a parent's status owned by the engine
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ObservedStatus {
    /// Read the engine status from a parent object; malformed status reads as empty
    pub fn of(obj: &DynamicObject) -> Self {
        obj.data
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default()
    }
}

/// Whether the status write was issued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    Elided,
}

impl StatusWrite {
    pub fn label(&self) -> &'static str {
        match self {
            StatusWrite::Written => "written",
            StatusWrite::Elided => "elided",
        }
    }
}

/// Skips rooted in an optional node are a supported configuration
fn skipped_optional<P>(workflow: &Workflow<P>, outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Skipped { cause } => workflow
            .node(cause)
            .map(|n| n.is_optional())
            .unwrap_or(false),
        _ => false,
    }
}

fn join(names: &BTreeSet<&str>) -> String {
    names.iter().copied().collect::<Vec<_>>().join(", ")
}

/// Conditions for a completed pass, `Ready` first, then the condition
/// groups in evaluation order
pub fn compute_conditions<P>(
    workflow: &Workflow<P>,
    report: &PassReport,
    previous: &[Condition],
    generation: Option<i64>,
) -> Vec<Condition> {
    let mut conditions = vec![ready_condition(workflow, report, previous, generation)];

    for group in workflow.condition_types() {
        let members: Vec<(&str, &Outcome)> = workflow
            .nodes()
            .iter()
            .filter(|n| n.condition_type() == Some(group.as_str()))
            .filter_map(|n| report.outcome(n.name()).map(|o| (n.name(), o)))
            .collect();

        let failed: Vec<String> = members
            .iter()
            .filter_map(|(name, o)| match o {
                Outcome::Error { cause, message } if cause == name => {
                    Some(format!("{}: {}", name, message))
                }
                Outcome::Error { cause, .. } => Some(format!("{}: dependency {} failed", name, cause)),
                _ => None,
            })
            .collect();
        let withheld: BTreeSet<&str> = members
            .iter()
            .filter(|(_, o)| o.is_skipped() && !skipped_optional(workflow, o))
            .filter_map(|(_, o)| match o {
                Outcome::Skipped { cause } => Some(cause.as_str()),
                _ => None,
            })
            .collect();
        let disabled = !members.is_empty()
            && members.iter().all(|(_, o)| skipped_optional(workflow, o));

        let (status, reason, message) = if !failed.is_empty() {
            (
                CONDITION_STATUS_FALSE,
                REASON_DEPENDENT_FAILED,
                failed.join("; "),
            )
        } else if !withheld.is_empty() {
            (
                CONDITION_STATUS_FALSE,
                REASON_PRECONDITION_NOT_MET,
                format!("precondition of dependent {} not met", join(&withheld)),
            )
        } else if disabled {
            (
                CONDITION_STATUS_TRUE,
                REASON_DISABLED,
                "all dependents disabled".to_string(),
            )
        } else {
            (
                CONDITION_STATUS_TRUE,
                REASON_RECONCILED,
                "all dependents reconciled".to_string(),
            )
        };
        conditions.push(build_condition(
            previous, &group, status, reason, &message, generation,
        ));
    }

    conditions
}

fn ready_condition<P>(
    workflow: &Workflow<P>,
    report: &PassReport,
    previous: &[Condition],
    generation: Option<i64>,
) -> Condition {
    let causes: BTreeSet<&str> = report
        .errors()
        .filter_map(|r| match &r.outcome {
            Outcome::Error { cause, .. } => Some(cause.as_str()),
            _ => None,
        })
        .collect();

    if !causes.is_empty() {
        let details: Vec<String> = report
            .errors()
            .filter_map(|r| match &r.outcome {
                Outcome::Error { cause, message } if *cause == r.node => {
                    Some(format!("{}: {}", r.node, message))
                }
                _ => None,
            })
            .collect();
        let message = format!(
            "dependent {} failed ({})",
            join(&causes),
            details.join("; ")
        );
        return build_condition(
            previous,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_FALSE,
            REASON_RECONCILE_ERROR,
            &message,
            generation,
        );
    }

    let withheld: Vec<&Outcome> = report
        .results
        .iter()
        .map(|r| &r.outcome)
        .filter(|o| o.is_skipped() && !skipped_optional(workflow, o))
        .collect();
    if !withheld.is_empty() {
        let roots: BTreeSet<&str> = withheld
            .iter()
            .filter_map(|o| match o {
                Outcome::Skipped { cause } => Some(cause.as_str()),
                _ => None,
            })
            .collect();
        let skipped: BTreeSet<&str> = report
            .results
            .iter()
            .filter(|r| r.outcome.is_skipped() && !skipped_optional(workflow, &r.outcome))
            .map(|r| r.node.as_str())
            .collect();
        let message = format!(
            "precondition of dependent {} not met; skipped: {}",
            join(&roots),
            join(&skipped)
        );
        return build_condition(
            previous,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_FALSE,
            REASON_PRECONDITION_NOT_MET,
            &message,
            generation,
        );
    }

    build_condition(
        previous,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_TRUE,
        REASON_RECONCILED,
        "all dependents reconciled",
        generation,
    )
}

/// Conditions for a parent whose spec cannot be reconciled at all
pub fn invalid_spec_conditions(
    previous: &[Condition],
    generation: Option<i64>,
    message: &str,
) -> Vec<Condition> {
    vec![build_condition(
        previous,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_FALSE,
        REASON_INVALID_SPEC,
        message,
        generation,
    )]
}

/// Writes engine status to the parent's status subresource
pub struct StatusAggregator {
    store: Arc<dyn ObjectStore>,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Replace the parent's conditions, unless it already reports them for
    /// this generation
    pub async fn write(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        previous: &ObservedStatus,
        generation: Option<i64>,
        conditions: Vec<Condition>,
    ) -> Result<StatusWrite> {
        if previous.observed_generation == generation
            && same_conditions(&previous.conditions, &conditions)
        {
            debug!(parent = %key, "Status unchanged, skipping write");
            return Ok(StatusWrite::Elided);
        }

        let patch = serde_json::json!({
            "observedGeneration": generation,
            "conditions": conditions,
        });
        self.store.patch_status(ar, key, &patch).await?;
        debug!(parent = %key, "Status updated");
        Ok(StatusWrite::Written)
    }
}
