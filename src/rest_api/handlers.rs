//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{error, instrument};

use crate::controller::{find_condition, ObjectKey, ObservedStatus, CONDITION_STATUS_UNKNOWN, CONDITION_TYPE_READY};

use super::dto::{
    ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse,
};
use super::server::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn summarize(obj: &DynamicObject, status: &ObservedStatus) -> ClusterSummary {
    let ready = find_condition(&status.conditions, CONDITION_TYPE_READY);
    ClusterSummary {
        name: obj.name_any(),
        namespace: obj.namespace().unwrap_or_default(),
        generation: obj.metadata.generation,
        observed_generation: status.observed_generation,
        ready: ready
            .map(|c| c.status.clone())
            .unwrap_or_else(|| CONDITION_STATUS_UNKNOWN.to_string()),
        reason: ready.map(|c| c.reason.clone()),
    }
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List all ReviewClusters in the watched scope
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ClusterListResponse>, ApiError> {
    match state
        .store
        .list(&state.parent, state.namespace.as_deref(), None)
        .await
    {
        Ok(objects) => {
            let items: Vec<ClusterSummary> = objects
                .iter()
                .map(|obj| summarize(obj, &ObservedStatus::of(obj)))
                .collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list clusters: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific ReviewCluster with its conditions
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<Arc<ApiState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterDetailResponse>, ApiError> {
    let key = ObjectKey::namespaced(&namespace, name.clone());
    match state.store.get(&state.parent, &key).await {
        Ok(Some(obj)) => {
            let status = ObservedStatus::of(&obj);
            Ok(Json(ClusterDetailResponse {
                summary: summarize(&obj, &status),
                spec: obj.data.get("spec").cloned().unwrap_or_default(),
                conditions: status.conditions,
                created_at: obj
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0.to_rfc3339()),
            }))
        }
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Cluster {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get cluster {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
