//! API error types and response handling.
//!
//! Every handler error becomes a JSON [`ErrorResponse`] with a status code
//! taken from the underlying pipeline error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beaconkit_core::{BeaconKitError, ConfigError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - malformed input from the client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - the beacon or ledger entry does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - the pipeline is in the wrong state for the request.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - well-formed input the pipeline rejects.
    Unprocessable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details.
        details: Option<String>,
    },

    /// 503 Service Unavailable - the async runtime is not available.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "UNKNOWN_BEACON",
    "message": "beacon F7826DA6-4FA2-4E98-8024-BC5B71E0893E-1-7 is not defined in any loaded zone",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code.
    #[schema(example = "UNKNOWN_BEACON")]
    pub error: String,

    /// Human-readable error message.
    pub message: String,

    /// Optional additional details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Shorthand for a 400 with the given code.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a 404 with the given code.
    pub fn not_found(error_code: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, message, details) = match self {
            Self::BadRequest { error_code, message }
            | Self::NotFound { error_code, message }
            | Self::Conflict { error_code, message }
            | Self::Unprocessable { error_code, message }
            | Self::ServiceUnavailable { error_code, message } => (error_code, message, None),

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                (error_code, message, details.map(serde_json::Value::String))
            }
        };

        (status, Json(ErrorResponse { error, message, details })).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Unprocessable { message, .. } => write!(f, "Unprocessable: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<BeaconKitError> for ApiError {
    fn from(err: BeaconKitError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            400 => Self::BadRequest { error_code, message },
            404 => Self::NotFound { error_code, message },
            409 => Self::Conflict { error_code, message },
            422 => Self::Unprocessable { error_code, message },
            503 => Self::ServiceUnavailable { error_code, message },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::from(BeaconKitError::from(err))
    }
}
