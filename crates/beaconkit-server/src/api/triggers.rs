//! Manual firing and occurrence ledger endpoints.

use axum::extract::{Query, State};
use axum::Json;
use beaconkit_core::{BeaconId, BeaconKitError, EventType, FireDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Manual fire request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "beacon": "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-1-7",
    "event": "enter"
}))]
pub struct FireRequest {
    /// Beacon identifier, `UUID-major-minor`.
    pub beacon: String,

    /// Event type to fire for.
    pub event: EventType,
}

/// Ledger lookup parameters.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OccurrenceQuery {
    /// Beacon identifier, `UUID-major-minor`.
    pub beacon: String,

    /// Trigger identifier.
    pub trigger: String,
}

/// Recorded occurrences of one trigger on one beacon.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OccurrenceResponse {
    /// Beacon identifier.
    pub beacon: String,

    /// Trigger identifier.
    pub trigger: String,

    /// Occurrences recorded since the last reload.
    pub count: u64,

    /// Time of the most recent occurrence.
    #[schema(nullable)]
    pub last_at: Option<DateTime<Utc>>,
}

fn parse_beacon(raw: &str) -> Result<BeaconId, ApiError> {
    raw.parse()
        .map_err(|_| BeaconKitError::InvalidIdentifier(raw.to_string()).into())
}

/// Fire a trigger by hand.
#[utoipa::path(
    post,
    path = "/api/fire",
    tag = "triggers",
    operation_id = "forceFire",
    summary = "Fire a trigger manually",
    description = "Dispatches the first trigger of the beacon that applies to the event type. \
        Conditions are not evaluated and no occurrence is recorded. Works whether or not \
        monitoring is running.",
    request_body = FireRequest,
    responses(
        (status = 200, description = "Trigger dispatched", body = FireDecision),
        (status = 400, description = "Malformed beacon identifier", body = crate::api::ErrorResponse),
        (status = 404, description = "Beacon not in any loaded zone", body = crate::api::ErrorResponse),
        (status = 422, description = "No trigger applies to the event", body = crate::api::ErrorResponse)
    )
)]
pub async fn force_fire(
    State(state): State<SharedState>,
    Json(request): Json<FireRequest>,
) -> ApiResult<Json<FireDecision>> {
    let beacon = parse_beacon(&request.beacon)?;
    let decision = state.orchestrator.force_fire(beacon, request.event)?;
    Ok(Json(decision))
}

/// Read the occurrence ledger.
#[utoipa::path(
    get,
    path = "/api/occurrences",
    tag = "triggers",
    operation_id = "getOccurrences",
    summary = "Get occurrence count",
    description = "Returns how often the trigger has fired on the beacon since the zones were \
        last loaded. Pairs that never fired report a count of zero.",
    params(OccurrenceQuery),
    responses(
        (status = 200, description = "Ledger entry", body = OccurrenceResponse),
        (status = 400, description = "Malformed beacon identifier", body = crate::api::ErrorResponse),
        (status = 404, description = "Beacon not in any loaded zone", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_occurrences(
    State(state): State<SharedState>,
    Query(query): Query<OccurrenceQuery>,
) -> ApiResult<Json<OccurrenceResponse>> {
    let beacon = parse_beacon(&query.beacon)?;
    if state.orchestrator.engine().index().beacon(beacon).is_none() {
        return Err(BeaconKitError::UnknownBeacon(beacon).into());
    }

    let occurrence = state.orchestrator.occurrence(beacon, &query.trigger);
    Ok(Json(OccurrenceResponse {
        beacon: beacon.identifier(),
        trigger: query.trigger,
        count: occurrence.map_or(0, |o| o.count),
        last_at: occurrence.map(|o| o.last_at),
    }))
}
