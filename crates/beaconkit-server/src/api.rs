//! HTTP API routes and handlers.
//!
//! - `health` - service health check
//! - `monitoring` - pipeline status, start/stop/pause/resume
//! - `samples` - ranging sample intake
//! - `triggers` - manual firing and occurrence counts
//! - `dispatches` - dispatch history
//! - `zones` - zone definition reload
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod dispatches;
pub mod error;
pub mod health;
pub mod monitoring;
pub mod openapi;
pub mod samples;
pub mod triggers;
pub mod zones;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /status            - Pipeline status
/// ├── /monitoring        - start, stop, pause, resume
/// ├── /samples           - Ranging sample intake
/// ├── /fire              - Manual trigger fire
/// ├── /occurrences       - Occurrence ledger lookup
/// ├── /dispatches        - Dispatch history
/// ├── /zones/reload      - Zone definition reload
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/status", get(monitoring::get_status))
                .route("/samples", post(samples::push_samples))
                .route("/fire", post(triggers::force_fire))
                .route("/occurrences", get(triggers::get_occurrences))
                .route("/dispatches", get(dispatches::get_dispatches))
                .route("/zones/reload", post(zones::reload_zones))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/monitoring", monitoring::router()),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
