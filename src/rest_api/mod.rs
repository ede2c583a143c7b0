//! REST API module for external integrations
//!
//! Provides a read-only HTTP API for querying ReviewClusters and the
//! engine's health and metrics.

mod dto;
mod handlers;
mod server;

pub use dto::{ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse};
pub use server::{router, run_server, ApiState};
