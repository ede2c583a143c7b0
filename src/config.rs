//! Engine configuration

use std::time::Duration;

use crate::controller::Backoff;
use crate::error::{Error, Result};

/// Tunables for one controller instance
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Reconcile workers pulling from the queue
    pub workers: usize,
    /// Dependents evaluated concurrently within one pass
    pub max_concurrent_dependents: usize,
    /// Requeue backoff after a failed pass
    pub backoff: Backoff,
    /// Attempts per write before a conflict storm is surfaced as an error
    pub conflict_retries: u32,
    /// Attempts per garbage collection call on transient errors
    pub gc_attempts: u32,
    /// Re-check interval after a successful pass
    pub resync: Option<Duration>,
    /// Field manager and managed-by label value
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            max_concurrent_dependents: 4,
            backoff: Backoff::default(),
            conflict_retries: 3,
            gc_attempts: 3,
            resync: Some(Duration::from_secs(300)),
            field_manager: "review-operator".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.max_concurrent_dependents == 0 {
            return Err(Error::ConfigError(
                "max concurrent dependents must be at least 1".to_string(),
            ));
        }
        if self.backoff.min.is_zero() || self.backoff.min > self.backoff.max {
            return Err(Error::ConfigError(format!(
                "invalid backoff range {:?}..{:?}",
                self.backoff.min, self.backoff.max
            )));
        }
        if self.conflict_retries == 0 {
            return Err(Error::ConfigError(
                "conflict retries must be at least 1".to_string(),
            ));
        }
        if self.field_manager.is_empty() {
            return Err(Error::ConfigError("field manager must not be empty".to_string()));
        }
        Ok(())
    }
}
