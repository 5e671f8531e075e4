//! Zone definition reload.

use axum::extract::State;
use axum::Json;
use beaconkit_core::ConfigError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::{load_zones, SharedState};

/// Outcome of a reload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    /// File the zones were read from.
    pub path: String,

    /// Zones now loaded.
    pub zones: usize,

    /// Beacons now loaded.
    pub beacons: usize,

    /// Triggers now loaded.
    pub triggers: usize,
}

/// Reload zone definitions from disk.
#[utoipa::path(
    post,
    path = "/api/zones/reload",
    tag = "zones",
    operation_id = "reloadZones",
    summary = "Reload zone definitions",
    description = "Re-reads the configured zone file and swaps it in. Occurrence counts start \
        over and pending leaves are cancelled. If the file is invalid the current zones stay.",
    responses(
        (status = 200, description = "Zones reloaded", body = ReloadResponse),
        (status = 422, description = "Zone file invalid or not configured", body = crate::api::ErrorResponse),
        (status = 500, description = "Zone file unreadable", body = crate::api::ErrorResponse)
    )
)]
pub async fn reload_zones(State(state): State<SharedState>) -> ApiResult<Json<ReloadResponse>> {
    let Some(path) = state.settings.zones.path.clone() else {
        return Err(ConfigError::Validation {
            field: "zones.path".to_string(),
            message: "no zone file configured".to_string(),
        }
        .into());
    };

    let zones = load_zones(&state.settings)?;
    state.orchestrator.reload(&zones)?;

    let status = state.orchestrator.status();
    Ok(Json(ReloadResponse {
        path: path.display().to_string(),
        zones: status.zones,
        beacons: status.beacons,
        triggers: status.triggers,
    }))
}
