//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use kube::api::ApiResource;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ObjectStore;
use crate::{Error, Result};

use super::handlers;

/// Shared state for request handlers
pub struct ApiState {
    pub store: Arc<dyn ObjectStore>,
    /// Kind served under `/api/v1/clusters`
    pub parent: ApiResource,
    pub namespace: Option<String>,
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, axum::http::StatusCode> {
    crate::controller::metrics::encode_text()
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn router(state: Arc<ApiState>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/clusters", get(handlers::list_clusters))
        .route(
            "/api/v1/clusters/{namespace}/{name}",
            get(handlers::get_cluster),
        );
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
