//! Dispatch history endpoint.

use axum::extract::{Query, State};
use axum::Json;
use beaconkit_core::DispatchCounters;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::dispatcher::DispatchRecord;
use crate::state::SharedState;

const DEFAULT_LIMIT: usize = 50;

/// History paging parameters.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DispatchQuery {
    /// Maximum number of records to return (default 50).
    pub limit: Option<usize>,
}

/// Recent dispatches, newest first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DispatchHistoryResponse {
    /// Dispatch counters since start.
    pub counters: DispatchCounters,

    /// Records held in memory.
    pub retained: usize,

    /// The returned records.
    pub entries: Vec<DispatchRecord>,
}

/// List recent dispatches.
#[utoipa::path(
    get,
    path = "/api/dispatches",
    tag = "triggers",
    operation_id = "getDispatches",
    summary = "List recent dispatches",
    description = "Returns the most recent fire decisions handed to the built-in dispatcher, \
        newest first, together with success, failure and abandonment counters.",
    params(DispatchQuery),
    responses(
        (status = 200, description = "Dispatch history", body = DispatchHistoryResponse)
    )
)]
pub async fn get_dispatches(
    State(state): State<SharedState>,
    Query(query): Query<DispatchQuery>,
) -> Json<DispatchHistoryResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Json(DispatchHistoryResponse {
        counters: state.orchestrator.status().dispatches,
        retained: state.history.len(),
        entries: state.history.recent(limit),
    })
}
