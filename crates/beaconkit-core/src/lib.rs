//! # beaconkit-core
//!
//! Turns noisy proximity-beacon ranging samples into debounced enter, leave and
//! range events, and decides which configured trigger fires for each.
//!
//! ## Architecture
//!
//! - [`batcher`] - last-wins-per-region sample batching with a periodic flush
//! - [`ledger`] - per-beacon, per-trigger occurrence counters
//! - [`condition`] - condition checks, the type registry and the evaluator
//! - [`builtins`] - the built-in condition types
//! - [`scheduler`] - single-slot-per-key delayed callbacks
//! - [`engine`] - trigger matching and deferred leave handling
//! - [`orchestrator`] - the pipeline facade hosts talk to
//! - [`zone`] / [`index`] - zone definitions and their compiled form
//! - [`config`] - layered runtime settings
//! - [`error`] - error types
//! - [`types`] - shared domain types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod batcher;
pub mod builtins;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod ledger;
pub mod orchestrator;
pub mod scheduler;
pub mod types;
pub mod zone;

pub use batcher::{RangeBatcher, RegionBatch};
pub use builtins::LiteralExpressionEvaluator;
pub use condition::{
    ConditionCheck, ConditionContext, ConditionError, ConditionEvaluator, ConditionRegistry, ExpressionEvaluator,
    ParameterError,
};
pub use config::{default_config_path, EngineConfig, ServerConfig, Settings, ZonesConfig};
pub use engine::{EngineOutcome, FireDecision, TriggerEngine};
pub use error::{BeaconKitError, ConfigError, Result};
pub use index::{BeaconIndex, IndexedBeacon, Trigger};
pub use ledger::{Occurrence, OccurrenceLedger};
pub use orchestrator::{
    ActionDispatcher, DispatchCompletion, DispatchCounters, DispatchResult, Orchestrator, OrchestratorStatus,
    PresenceTracker,
};
pub use scheduler::{DelayScheduler, ScheduleError};
pub use types::{BeaconEvent, BeaconId, BeaconSnapshot, EventType, Proximity, RangedSample, Reading, UnknownVariant};
pub use zone::{ActionRef, BeaconDefinition, ConditionDefinition, Location, TriggerDefinition, ZoneDefinition, ZoneSet};
