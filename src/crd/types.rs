//! Shared types for the review operator CRDs
//!
//! - [`Condition`] - Kubernetes-style status condition written by the status aggregator
//! - [`StorageConfig`] - Storage classes and sizes for the shared repository volume
//! - [`PrimaryConfig`] / [`ReplicaConfig`] - Review server instances
//! - [`IngressConfig`] - External HTTP access
//! - [`MaintenanceConfig`] - Scheduled repository maintenance

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "StorageReady")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation that the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Compare everything except the transition timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Storage configuration of the shared repository volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Storage class for the shared repository volume (ReadWriteMany)
    #[serde(default = "default_rwx_class")]
    pub read_write_many_class: String,
    /// Size of the shared git repository volume (e.g. "50Gi")
    #[serde(default = "default_repository_size")]
    pub repository_size: String,
}

fn default_rwx_class() -> String {
    "nfs".to_string()
}

fn default_repository_size() -> String {
    "50Gi".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            read_write_many_class: default_rwx_class(),
            repository_size: default_repository_size(),
        }
    }
}

/// Compute resources for a container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
}

/// The primary (read-write) review server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    /// Number of primary pods; 0 takes the primary offline
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            resources: None,
        }
    }
}

/// Read-only replicas serving fetch traffic
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaConfig {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

fn default_replicas() -> i32 {
    1
}

/// Ingress configuration for external access
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hostname routed to the primary service
    #[serde(default)]
    pub host: String,
    /// Name of the TLS secret; plain HTTP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Scheduled maintenance tasks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceConfig {
    /// Cron schedule (5 fields) for git garbage collection; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_gc_schedule: Option<String>,
}
