//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use beaconkit_core::{ActionDispatcher, ConditionRegistry, ConfigError, Orchestrator, Settings, ZoneSet};
use tracing::info;

use crate::dispatcher::HistoryDispatcher;

/// Shared application state handle.
pub type SharedState = Arc<AppState>;

/// Everything the handlers need.
#[derive(Debug)]
pub struct AppState {
    /// The event pipeline.
    pub orchestrator: Orchestrator,
    /// The dispatcher the pipeline reports to.
    pub history: Arc<HistoryDispatcher>,
    /// Settings the server was started with.
    pub settings: Settings,
    started_at: Instant,
}

impl AppState {
    /// Build the pipeline over already loaded zones.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the zones do not compile.
    pub fn new(settings: Settings, zones: &ZoneSet) -> Result<Self, ConfigError> {
        let history = Arc::new(HistoryDispatcher::new(settings.server.dispatch_history));
        let orchestrator = Orchestrator::new(
            &settings.engine,
            zones,
            ConditionRegistry::default(),
            Arc::clone(&history) as Arc<dyn ActionDispatcher>,
        )?;

        Ok(Self {
            orchestrator,
            history,
            settings,
            started_at: Instant::now(),
        })
    }

    /// Build the pipeline, reading zones from `settings.zones.path` when set.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the zone file cannot be read or compiled.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let zones = load_zones(&settings)?;
        Self::new(settings, &zones)
    }

    /// Seconds since the state was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Read the configured zone file, or an empty set when none is configured.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_zones(settings: &Settings) -> Result<ZoneSet, ConfigError> {
    let Some(path) = settings.zones.path.as_deref() else {
        info!("no zone file configured, starting without zones");
        return Ok(ZoneSet::default());
    };
    let zones = ZoneSet::from_path(path)?;
    info!(path = %path.display(), zones = zones.zones().len(), "zone definitions loaded");
    Ok(zones)
}
