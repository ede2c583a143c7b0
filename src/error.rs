//! Error types for the review operator

use thiserror::Error;

/// Classified failure reported by an [`ObjectStore`](crate::controller::ObjectStore)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The write carried a stale resource version or the object already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network, timeout or throttling failure; safe to retry
    #[error("transient API error: {0}")]
    Transient(String),

    /// Any other rejection from the API server
    #[error("API error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Map a kube client error onto the store taxonomy by HTTP status
    pub fn classify(err: &kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => StoreError::NotFound(resp.message.clone()),
                409 => StoreError::Conflict(resp.message.clone()),
                429 | 500..=599 => StoreError::Transient(resp.message.clone()),
                _ => StoreError::Other(resp.message.clone()),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Other(err.to_string()),
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        StoreError::classify(&err)
    }
}

/// Errors that can occur while running the operator
#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The dependsOn relation of a workflow contains a cycle
    #[error("Dependency cycle in workflow {workflow}: {}", .cycle.join(" -> "))]
    CyclicDependency { workflow: String, cycle: Vec<String> },

    #[error("Dependent {node} in workflow {workflow} depends on unknown dependent {missing}")]
    UnknownDependency {
        workflow: String,
        node: String,
        missing: String,
    },

    #[error("Dependent {node} registered twice in workflow {workflow}")]
    DuplicateNode { workflow: String, node: String },

    /// A resource builder or precondition rejected the parent spec
    #[error("Dependent {node} failed to build desired state: {message}")]
    BuilderError { node: String, message: String },

    #[error("Gave up on {resource} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { resource: String, attempts: u32 },

    #[error("Reconcile of {parent} left {failed} dependent(s) in error")]
    ReconcileFailed { parent: String, failed: usize },
}

impl Error {
    /// Whether the failure is expected to clear up on its own
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(e) => StoreError::classify(e).is_transient(),
            Error::Store(e) => e.is_transient() || e.is_conflict(),
            Error::ConflictRetriesExhausted { .. } => true,
            Error::ReconcileFailed { .. } => true,
            _ => false,
        }
    }

    /// Short label used for metrics and condition reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Store(StoreError::Conflict(_)) | Error::ConflictRetriesExhausted { .. } => {
                "conflict"
            }
            Error::Store(StoreError::Transient(_)) => "transient",
            Error::Store(_) => "store",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_)
            | Error::CyclicDependency { .. }
            | Error::UnknownDependency { .. }
            | Error::DuplicateNode { .. } => "config",
            Error::ValidationError(_) | Error::BuilderError { .. } => "validation",
            Error::ReconcileFailed { .. } => "dependent",
        }
    }
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
