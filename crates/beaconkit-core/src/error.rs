//! Error types for the beaconkit core library.
//!
//! Each concern has its own error type ([`ConfigError`] for loading and
//! validation, [`ScheduleError`] for the delay scheduler, and
//! [`ConditionError`](crate::condition::ConditionError), which never leaves the
//! evaluator). [`BeaconKitError`] unifies the ones callers can see and carries
//! the HTTP mapping used by the server.
//!
//! # Example
//!
//! ```rust
//! use beaconkit_core::error::{BeaconKitError, ConfigError};
//!
//! let err: BeaconKitError = ConfigError::Duplicate { kind: "zone", id: "lobby".into() }.into();
//! assert!(err.is_config_error());
//! assert_eq!(err.http_status_code(), 422);
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::condition::ParameterError;
use crate::scheduler::ScheduleError;
use crate::types::{BeaconId, EventType};

/// Errors raised while loading settings or zone definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A document could not be parsed.
    #[error("failed to parse {format}: {message}")]
    Parse {
        /// Document format.
        format: &'static str,
        /// Parser message.
        message: String,
    },

    /// The file extension is not a supported zone format.
    #[error("unsupported zone file format: {} (expected .json or .toml)", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Layered settings could not be assembled.
    #[error("failed to load settings: {0}")]
    Settings(String),

    /// A value is present but invalid.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An identifier appears more than once.
    #[error("duplicate {kind} '{id}'")]
    Duplicate {
        /// What kind of entity is duplicated.
        kind: &'static str,
        /// The repeated identifier.
        id: String,
    },

    /// A condition uses a type tag nothing is registered for.
    #[error("trigger '{trigger}' uses unknown condition type '{tag}'")]
    UnknownConditionType {
        /// Trigger identifier.
        trigger: String,
        /// Unregistered tag.
        tag: String,
    },

    /// A condition's parameters were rejected by its factory.
    #[error("trigger '{trigger}' has an invalid '{tag}' condition: {source}")]
    InvalidCondition {
        /// Trigger identifier.
        trigger: String,
        /// Condition tag.
        tag: String,
        /// Factory error.
        source: ParameterError,
    },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Settings(err.to_string())
    }
}

/// The unified error type for beaconkit operations.
#[derive(Debug, Error)]
pub enum BeaconKitError {
    /// Settings or zone definitions are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A delayed event could not be scheduled.
    #[error(transparent)]
    Scheduling(#[from] ScheduleError),

    /// The beacon is not part of the loaded zones.
    #[error("beacon {0} is not defined in any loaded zone")]
    UnknownBeacon(BeaconId),

    /// No trigger on the beacon handles the event type.
    #[error("beacon {beacon} has no trigger for '{event}' events")]
    NoApplicableTrigger {
        /// Beacon identity.
        beacon: BeaconId,
        /// Requested event type.
        event: EventType,
    },

    /// Monitoring has not been started.
    #[error("monitoring is not running")]
    NotRunning,

    /// The operation needs a Tokio runtime and none is available.
    #[error("no async runtime available")]
    RuntimeUnavailable,

    /// A beacon identifier string could not be parsed.
    #[error("invalid beacon identifier '{0}'. Expected UUID-major-minor.")]
    InvalidIdentifier(String),
}

/// A specialized [`Result`] type for beaconkit operations.
pub type Result<T> = std::result::Result<T, BeaconKitError>;

impl BeaconKitError {
    /// Returns `true` if this error comes from settings or zone loading.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns `true` if this error comes from the delay scheduler.
    #[inline]
    #[must_use]
    pub const fn is_scheduling_error(&self) -> bool {
        matches!(self, Self::Scheduling(_) | Self::RuntimeUnavailable)
    }

    /// Returns `true` if this error is a normal operational outcome rather
    /// than a fault.
    #[inline]
    #[must_use]
    pub const fn is_expected_state(&self) -> bool {
        matches!(
            self,
            Self::NotRunning
                | Self::NoApplicableTrigger { .. }
                | Self::Scheduling(ScheduleError::AlreadyScheduled { .. })
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidIdentifier(_) => 400,
            Self::UnknownBeacon(_) => 404,
            Self::NotRunning | Self::Scheduling(ScheduleError::AlreadyScheduled { .. }) => 409,
            Self::Config(ConfigError::Read { .. }) => 500,
            Self::Config(_)
            | Self::NoApplicableTrigger { .. }
            | Self::Scheduling(ScheduleError::DelayOutOfRange { .. }) => 422,
            Self::RuntimeUnavailable | Self::Scheduling(ScheduleError::RuntimeUnavailable) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::Read { .. }) => "CONFIG_READ_ERROR",
            Self::Config(ConfigError::Parse { .. } | ConfigError::UnsupportedFormat(_)) => "CONFIG_PARSE_ERROR",
            Self::Config(
                ConfigError::UnknownConditionType { .. } | ConfigError::InvalidCondition { .. },
            ) => "INVALID_CONDITION",
            Self::Config(_) => "CONFIG_VALIDATION_ERROR",
            Self::Scheduling(ScheduleError::AlreadyScheduled { .. }) => "ALREADY_SCHEDULED",
            Self::Scheduling(ScheduleError::DelayOutOfRange { .. }) => "DELAY_OUT_OF_RANGE",
            Self::Scheduling(ScheduleError::RuntimeUnavailable) | Self::RuntimeUnavailable => {
                "RUNTIME_UNAVAILABLE"
            }
            Self::UnknownBeacon(_) => "UNKNOWN_BEACON",
            Self::NoApplicableTrigger { .. } => "NO_APPLICABLE_TRIGGER",
            Self::NotRunning => "NOT_RUNNING",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn beacon() -> BeaconId {
        BeaconId::new(Uuid::nil(), 1, 1)
    }

    fn too_long() -> BeaconKitError {
        ScheduleError::DelayOutOfRange {
            delay: std::time::Duration::MAX,
        }
        .into()
    }

    #[test]
    fn test_classification() {
        let config: BeaconKitError = ConfigError::Parse {
            format: "json",
            message: "eof".into(),
        }
        .into();
        assert!(config.is_config_error());
        assert!(!config.is_scheduling_error());

        let scheduling: BeaconKitError = ScheduleError::AlreadyScheduled { key: "b".into() }.into();
        assert!(scheduling.is_scheduling_error());
        assert!(scheduling.is_expected_state());

        assert!(BeaconKitError::NotRunning.is_expected_state());
        assert!(!BeaconKitError::UnknownBeacon(beacon()).is_expected_state());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(BeaconKitError::InvalidIdentifier("x".into()).http_status_code(), 400);
        assert_eq!(BeaconKitError::UnknownBeacon(beacon()).http_status_code(), 404);
        assert_eq!(BeaconKitError::NotRunning.http_status_code(), 409);
        assert_eq!(
            BeaconKitError::NoApplicableTrigger {
                beacon: beacon(),
                event: EventType::Exit
            }
            .http_status_code(),
            422
        );
        let read: BeaconKitError = ConfigError::Read {
            path: PathBuf::from("/missing.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        }
        .into();
        assert_eq!(read.http_status_code(), 500);
        assert_eq!(BeaconKitError::RuntimeUnavailable.http_status_code(), 503);
        assert_eq!(too_long().http_status_code(), 422);
    }

    #[test]
    fn test_error_codes() {
        let unknown: BeaconKitError = ConfigError::UnknownConditionType {
            trigger: "t".into(),
            tag: "x".into(),
        }
        .into();
        assert_eq!(unknown.error_code(), "INVALID_CONDITION");
        assert_eq!(BeaconKitError::NotRunning.error_code(), "NOT_RUNNING");
        assert_eq!(too_long().error_code(), "DELAY_OUT_OF_RANGE");
        assert!(!too_long().is_expected_state());
    }
}
