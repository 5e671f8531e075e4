//! Runtime settings.
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `BEACONKIT__*` environment variables
//! (`BEACONKIT__ENGINE__LEAVE_DELAY_SECS=10`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ConfigError;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BEACONKIT";

/// Longest accepted flush period.
pub const MAX_BATCH_INTERVAL_MS: u64 = 60_000;

/// Longest accepted leave delay (one day).
pub const MAX_LEAVE_DELAY_SECS: u64 = 86_400;

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Event pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Range batch flush period in milliseconds.
    pub batch_interval_ms: u64,
    /// Delay before a leave event is acted on, in seconds.
    pub leave_delay_secs: u64,
    /// Accuracy change in metres that counts as a range update when the
    /// proximity tier is unchanged.
    pub range_accuracy_threshold_m: f64,
    /// Number of processed event ids remembered for double-fire protection.
    pub recent_event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 1000,
            leave_delay_secs: 5,
            range_accuracy_threshold_m: 0.5,
            recent_event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Flush period as a [`Duration`].
    #[must_use]
    pub const fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Leave delay as a [`Duration`].
    #[must_use]
    pub const fn leave_delay(&self) -> Duration {
        Duration::from_secs(self.leave_delay_secs)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval_ms == 0 || self.batch_interval_ms > MAX_BATCH_INTERVAL_MS {
            return Err(invalid(
                "engine.batch_interval_ms",
                &format!("must be between 1 and {MAX_BATCH_INTERVAL_MS}"),
            ));
        }
        if self.leave_delay_secs > MAX_LEAVE_DELAY_SECS {
            return Err(invalid(
                "engine.leave_delay_secs",
                &format!("must be at most {MAX_LEAVE_DELAY_SECS}"),
            ));
        }
        let threshold = self.range_accuracy_threshold_m;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(invalid(
                "engine.range_accuracy_threshold_m",
                "must be a non-negative number",
            ));
        }
        if self.recent_event_capacity == 0 {
            return Err(invalid("engine.recent_event_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Where zone definitions come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ZonesConfig {
    /// Zone definition file (`.json` or `.toml`).
    #[schema(value_type = Option<String>)]
    pub path: Option<PathBuf>,
}

/// HTTP server options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind_address: String,
    /// Production logging (JSON files) instead of pretty console output.
    pub production: bool,
    /// Dispatched decisions kept for the history endpoint.
    pub dispatch_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
            dispatch_history: 256,
        }
    }
}

/// Complete runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Settings {
    /// Event pipeline tuning.
    pub engine: EngineConfig,
    /// Zone definition source.
    pub zones: ZonesConfig,
    /// HTTP server options.
    pub server: ServerConfig,
}

impl Settings {
    /// Load settings from `path` (or the default location) plus environment
    /// overrides. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Settings`] if a source cannot be read or
    /// deserialized, or a validation error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        Self::load_with_env(&path, config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: &Path, env: config::Environment) -> Result<Self, ConfigError> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.server.dispatch_history == 0 {
            return Err(invalid("server.dispatch_history", "must be greater than zero"));
        }
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid("server.bind_address", "must be a socket address like 0.0.0.0:3000"));
        }
        Ok(())
    }
}

/// Default settings file location.
///
/// `/etc/beaconkit/config.toml` on Linux, the per-user config directory
/// elsewhere.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/beaconkit/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconkit").map_or_else(
            || PathBuf::from("beaconkit.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}
