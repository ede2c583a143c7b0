//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Aggregate condition reported for every parent
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Condition reasons written by the status aggregator
pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_DEPENDENT_FAILED: &str = "DependentFailed";
pub const REASON_PRECONDITION_NOT_MET: &str = "PreconditionNotMet";
pub const REASON_DISABLED: &str = "Disabled";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Build a condition, keeping the transition time of `previous` when the
/// status did not change
pub fn build_condition(
    previous: &[Condition],
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    let last_transition_time = find_condition(previous, type_)
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Whether two condition lists say the same thing, ignoring transition times
/// and ordering
pub fn same_conditions(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a.iter().all(|c| {
            find_condition(b, &c.type_)
                .map(|other| c.same_state(other))
                .unwrap_or(false)
        })
}
