//! Ranging sample intake.

use axum::extract::State;
use axum::Json;
use beaconkit_core::zone::is_valid_identifier;
use beaconkit_core::{BeaconKitError, RangedSample};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// One ranging callback from the scanning layer.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "region": "lobby",
    "samples": [{
        "proximity_uuid": "F7826DA6-4FA2-4E98-8024-BC5B71E0893E",
        "major": 1,
        "minor": 7,
        "proximity": "near",
        "accuracy": 1.4,
        "rssi": -63
    }]
}))]
pub struct SamplesRequest {
    /// Region that was ranged.
    pub region: String,

    /// Everything seen in the region. An empty list means nothing was seen.
    #[serde(default)]
    pub samples: Vec<RangedSample>,
}

/// Acknowledgement of buffered samples.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SamplesResponse {
    /// Region the samples were buffered under.
    pub region: String,

    /// Samples received.
    pub received: usize,
}

/// Push ranging samples.
#[utoipa::path(
    post,
    path = "/api/samples",
    tag = "samples",
    operation_id = "pushSamples",
    summary = "Push ranging samples",
    description = "Buffers the samples of one region until the next flush. A later push for \
        the same region within the flush period replaces this one.",
    request_body = SamplesRequest,
    responses(
        (status = 202, description = "Samples buffered", body = SamplesResponse),
        (status = 400, description = "Invalid region identifier", body = crate::api::ErrorResponse),
        (status = 409, description = "Monitoring is not running", body = crate::api::ErrorResponse)
    )
)]
pub async fn push_samples(
    State(state): State<SharedState>,
    Json(request): Json<SamplesRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<SamplesResponse>)> {
    if !is_valid_identifier(&request.region) {
        return Err(ApiError::bad_request(
            "INVALID_REGION",
            format!("invalid region identifier '{}'", request.region),
        ));
    }

    let received = request.samples.len();
    if !state.orchestrator.on_ranged_samples(request.samples, request.region.clone()) {
        return Err(BeaconKitError::NotRunning.into());
    }

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(SamplesResponse {
            region: request.region,
            received,
        }),
    ))
}
