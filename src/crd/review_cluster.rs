//! ReviewCluster Custom Resource Definition
//!
//! A ReviewCluster describes one code-review deployment: a primary server,
//! optional read replicas, the shared repository volume, ingress and
//! scheduled maintenance.

use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, IngressConfig, MaintenanceConfig, PrimaryConfig, ReplicaConfig, StorageConfig,
};

/// Structured validation error for `ReviewClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "review.operator.dev",
    version = "v1alpha1",
    kind = "ReviewCluster",
    namespaced,
    status = "ReviewClusterStatus",
    shortname = "rc",
    printcolumn = r#"{"name":"Primary","type":"integer","jsonPath":".spec.primary.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReviewClusterSpec {
    /// Container image of the review server
    pub image: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub primary: PrimaryConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<ReplicaConfig>,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl ReviewClusterSpec {
    /// Validate the spec, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.image.trim().is_empty() {
            errors.push(SpecValidationError::new("spec.image", "must not be empty"));
        }

        if self.primary.replicas < 0 {
            errors.push(SpecValidationError::new(
                "spec.primary.replicas",
                "must not be negative",
            ));
        }

        if let Some(replica) = &self.replica {
            if replica.replicas < 1 {
                errors.push(SpecValidationError::new(
                    "spec.replica.replicas",
                    "must be at least 1; remove spec.replica to disable replicas",
                ));
            }
        }

        if self.ingress.enabled && self.ingress.host.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.ingress.host",
                "is required when ingress is enabled",
            ));
        }

        if let Some(schedule) = &self.maintenance.git_gc_schedule {
            if let Err(e) = validate_cron_schedule(schedule) {
                errors.push(SpecValidationError::new(
                    "spec.maintenance.gitGcSchedule",
                    e,
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Accept standard five-field Kubernetes CronJob schedules
fn validate_cron_schedule(schedule: &str) -> Result<(), String> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let &[minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        return Err(format!(
            "expected 5 cron fields, found {} in {:?}",
            fields.len(),
            schedule
        ));
    };
    // The cron crate numbers weekdays 1-7 from Sunday, CronJobs 0-7; check
    // that field here and let the crate parse the rest.
    validate_day_of_week(day_of_week)
        .map_err(|e| format!("invalid schedule {:?}: {}", schedule, e))?;
    let rest = format!("0 {} {} {} {} *", minute, hour, day_of_month, month);
    cron::Schedule::from_str(&rest)
        .map(|_| ())
        .map_err(|e| format!("invalid schedule {:?}: {}", schedule, e))
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Day-of-week field: lists of `*`, `?`, days and ranges with optional steps.
/// Days are 0-7 (both ends Sunday) or three-letter names.
fn validate_day_of_week(field: &str) -> Result<(), String> {
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        if let Some(step) = step {
            match step.parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => return Err(format!("invalid day-of-week step {:?}", step)),
            }
        }
        if base == "*" || base == "?" {
            continue;
        }
        let (first, last) = base.split_once('-').unwrap_or((base, base));
        if weekday(first)? > weekday(last)? {
            return Err(format!("day-of-week range {:?} runs backwards", base));
        }
    }
    Ok(())
}

fn weekday(token: &str) -> Result<u32, String> {
    if let Some(day) = WEEKDAYS.iter().position(|d| d.eq_ignore_ascii_case(token)) {
        return Ok(day as u32);
    }
    match token.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week {:?}", token)),
    }
}

/// Status subresource written by the status aggregator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewClusterStatus {
    /// Generation of the spec the conditions were computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
