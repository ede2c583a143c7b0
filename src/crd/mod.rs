//! Custom Resource Definitions for the review operator
//!
//! This module defines the Kubernetes CRDs managed by the operator.

mod review_cluster;
pub mod types;


pub use review_cluster::{
    ReviewCluster, ReviewClusterSpec, ReviewClusterStatus, SpecValidationError,
};
pub use types::*;
