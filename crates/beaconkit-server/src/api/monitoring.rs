//! Monitoring lifecycle and status endpoints.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use beaconkit_core::OrchestratorStatus;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the monitoring router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_monitoring))
        .route("/stop", post(stop_monitoring))
        .route("/pause", post(pause_monitoring))
        .route("/resume", post(resume_monitoring))
}

/// Pipeline status plus server metadata.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Seconds since the server started.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Event pipeline status.
    pub pipeline: OrchestratorStatus,
}

/// Result of a lifecycle request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MonitoringResponse {
    /// Whether the request changed the pipeline state.
    pub changed: bool,

    /// Pipeline status after the request.
    pub pipeline: OrchestratorStatus,
}

impl MonitoringResponse {
    fn after(state: &SharedState, changed: bool) -> Json<Self> {
        Json(Self {
            changed,
            pipeline: state.orchestrator.status(),
        })
    }
}

/// Get pipeline status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "monitoring",
    operation_id = "getStatus",
    summary = "Get pipeline status",
    description = "Returns running and paused flags, loaded zone, beacon and trigger counts, \
        beacons currently present, pending leaves and dispatch counters.",
    responses(
        (status = 200, description = "Status retrieved", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        pipeline: state.orchestrator.status(),
    })
}

/// Start monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/start",
    tag = "monitoring",
    operation_id = "startMonitoring",
    summary = "Start monitoring",
    description = "Starts the batch flush loop. Samples pushed before this are ignored. \
        Starting a running pipeline changes nothing.",
    responses(
        (status = 200, description = "Monitoring running", body = MonitoringResponse),
        (status = 503, description = "No async runtime", body = crate::api::ErrorResponse)
    )
)]
pub async fn start_monitoring(State(state): State<SharedState>) -> ApiResult<Json<MonitoringResponse>> {
    let was_running = state.orchestrator.is_running();
    state.orchestrator.start()?;
    Ok(MonitoringResponse::after(&state, !was_running))
}

/// Stop monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/stop",
    tag = "monitoring",
    operation_id = "stopMonitoring",
    summary = "Stop monitoring",
    description = "Stops the flush loop, cancels pending leaves and forgets which beacons \
        are present. Occurrence counts are kept.",
    responses(
        (status = 200, description = "Monitoring stopped", body = MonitoringResponse)
    )
)]
pub async fn stop_monitoring(State(state): State<SharedState>) -> Json<MonitoringResponse> {
    let changed = state.orchestrator.stop();
    MonitoringResponse::after(&state, changed)
}

/// Pause monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/pause",
    tag = "monitoring",
    operation_id = "pauseMonitoring",
    summary = "Pause monitoring",
    description = "Samples keep being buffered but are not classified, and leaves that \
        come due while paused do not fire.",
    responses(
        (status = 200, description = "Monitoring paused", body = MonitoringResponse)
    )
)]
pub async fn pause_monitoring(State(state): State<SharedState>) -> Json<MonitoringResponse> {
    let changed = !state.orchestrator.is_paused();
    state.orchestrator.pause();
    MonitoringResponse::after(&state, changed)
}

/// Resume monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/resume",
    tag = "monitoring",
    operation_id = "resumeMonitoring",
    summary = "Resume monitoring",
    description = "Undoes a pause. Buffered samples are classified at the next flush.",
    responses(
        (status = 200, description = "Monitoring resumed", body = MonitoringResponse)
    )
)]
pub async fn resume_monitoring(State(state): State<SharedState>) -> Json<MonitoringResponse> {
    let changed = state.orchestrator.is_paused();
    state.orchestrator.resume();
    MonitoringResponse::after(&state, changed)
}
