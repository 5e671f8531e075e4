//! Health check API endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "monitoring": true
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Whether the event pipeline is monitoring.
    pub monitoring: bool,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns the service version and whether monitoring is running. \
        Use this endpoint for load balancer health checks.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        monitoring: state.orchestrator.is_running(),
    })
}
