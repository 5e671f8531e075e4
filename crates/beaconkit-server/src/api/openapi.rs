//! OpenAPI specification for the beaconkit API.
//!
//! Served at `/api/openapi.json` and written to disk by the `gen-openapi`
//! binary.

use axum::Json;
use beaconkit_core::{
    ActionRef, BeaconId, DispatchCounters, EventType, FireDecision, OrchestratorStatus, Proximity, RangedSample,
};
use utoipa::OpenApi;

use super::dispatches::DispatchHistoryResponse;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::monitoring::{MonitoringResponse, StatusResponse};
use super::samples::{SamplesRequest, SamplesResponse};
use super::triggers::{FireRequest, OccurrenceResponse};
use super::zones::ReloadResponse;
use crate::dispatcher::DispatchRecord;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI document as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for beaconkit.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "beaconkit API",
        version = "0.1.0",
        description = r#"
# beaconkit API

beaconkit turns proximity-beacon ranging samples into enter, leave and range
events and fires the triggers configured for each beacon.

## Flow

1. A scanning process pushes what it sees per region to `POST /api/samples`.
2. Once per flush period the latest samples of every region are classified.
3. Leaves are held back for a grace period and dropped if the beacon returns.
4. The first trigger whose conditions all pass is dispatched.

Dispatched decisions can be read back from `GET /api/dispatches`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local beaconkit server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "monitoring", description = "Pipeline lifecycle and status"),
        (name = "samples", description = "Ranging sample intake"),
        (name = "triggers", description = "Manual firing, occurrence counts and dispatch history"),
        (name = "zones", description = "Zone definition management")
    ),
    paths(
        super::health::health_check,
        super::monitoring::get_status,
        super::monitoring::start_monitoring,
        super::monitoring::stop_monitoring,
        super::monitoring::pause_monitoring,
        super::monitoring::resume_monitoring,
        super::samples::push_samples,
        super::triggers::force_fire,
        super::triggers::get_occurrences,
        super::dispatches::get_dispatches,
        super::zones::reload_zones,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            StatusResponse,
            MonitoringResponse,
            OrchestratorStatus,
            DispatchCounters,
            SamplesRequest,
            SamplesResponse,
            RangedSample,
            Proximity,
            BeaconId,
            EventType,
            FireRequest,
            FireDecision,
            ActionRef,
            OccurrenceResponse,
            DispatchHistoryResponse,
            DispatchRecord,
            ReloadResponse,
        )
    )
)]
pub struct ApiDoc;
