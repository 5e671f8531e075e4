//! Top-level pipeline.
//!
//! Raw samples go into the [`RangeBatcher`]. Each flush is diffed against the
//! beacons currently considered present to produce enter, leave and range
//! events, which the [`TriggerEngine`] evaluates. Fire decisions, immediate or
//! deferred, go to the host's [`ActionDispatcher`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use utoipa::ToSchema;

use crate::batcher::{RangeBatcher, RegionBatch};
use crate::condition::ConditionRegistry;
use crate::config::EngineConfig;
use crate::engine::{EngineOutcome, FireDecision, TriggerEngine};
use crate::error::{BeaconKitError, ConfigError, Result};
use crate::index::BeaconIndex;
use crate::ledger::Occurrence;
use crate::types::{BeaconEvent, BeaconId, EventType, RangedSample, Reading};
use crate::zone::ZoneSet;

/// Outcome reported by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// The action was performed.
    Succeeded,
    /// The action failed.
    Failed(String),
}

/// One-shot completion handle passed with each dispatch.
///
/// Dropping it without calling [`succeed`](Self::succeed) or
/// [`fail`](Self::fail) counts the dispatch as abandoned.
#[derive(Debug)]
pub struct DispatchCompletion {
    tx: oneshot::Sender<DispatchResult>,
}

impl DispatchCompletion {
    /// Report success.
    pub fn succeed(self) {
        let _ = self.tx.send(DispatchResult::Succeeded);
    }

    /// Report failure.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(DispatchResult::Failed(reason.into()));
    }
}

/// Performs actions for fire decisions. Implemented by the host.
///
/// `dispatch` is called from the pipeline's tasks and must not block; long
/// work belongs on a spawned task that completes `completion` later.
pub trait ActionDispatcher: Send + Sync {
    /// Perform (or start performing) the decision's action.
    fn dispatch(&self, decision: FireDecision, completion: DispatchCompletion);
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DispatchCounters {
    /// Decisions handed to the dispatcher.
    pub dispatched: u64,
    /// Completions reported as success.
    pub succeeded: u64,
    /// Completions reported as failure.
    pub failed: u64,
    /// Completion handles dropped without a result.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct DispatchStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl DispatchStats {
    fn record(&self, result: std::result::Result<DispatchResult, oneshot::error::RecvError>, trigger: &str) {
        match result {
            Ok(DispatchResult::Succeeded) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(trigger, "dispatch succeeded");
            }
            Ok(DispatchResult::Failed(reason)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(trigger, reason = %reason, "dispatch failed");
            }
            Err(_) => {
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(trigger, "dispatch abandoned without a result");
            }
        }
    }

    fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct Presence {
    region: String,
    reading: Reading,
}

/// Turns consecutive flushes into enter, leave and range transitions.
///
/// A beacon with `Unknown` proximity counts as absent. A beacon leaves only
/// when its region was delivered in the flush without it; regions missing from
/// a flush say nothing about their beacons.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    present: HashMap<BeaconId, Presence>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one flush. Range updates need a tier change or an accuracy
    /// change of at least `accuracy_threshold` metres.
    pub fn classify(&mut self, flush: &[RegionBatch], accuracy_threshold: f64) -> Vec<(EventType, BeaconId, Reading)> {
        let mut events = Vec::new();
        let delivered: HashSet<&str> = flush.iter().map(|batch| batch.region.as_str()).collect();
        let mut seen = HashSet::new();

        for batch in flush {
            for sample in batch.samples.iter().filter(|s| s.proximity.is_known()) {
                let beacon = sample.beacon_id();
                if !seen.insert(beacon) {
                    continue;
                }
                let reading = sample.reading();

                match self.present.get_mut(&beacon) {
                    None => {
                        events.push((EventType::Enter, beacon, reading));
                        self.present.insert(
                            beacon,
                            Presence {
                                region: batch.region.clone(),
                                reading,
                            },
                        );
                    }
                    Some(presence) => {
                        presence.region.clone_from(&batch.region);
                        if changed(&presence.reading, &reading, accuracy_threshold) {
                            events.push((EventType::Range, beacon, reading));
                            presence.reading = reading;
                        }
                    }
                }
            }
        }

        let mut gone: Vec<BeaconId> = self
            .present
            .iter()
            .filter(|(beacon, presence)| delivered.contains(presence.region.as_str()) && !seen.contains(*beacon))
            .map(|(beacon, _)| *beacon)
            .collect();
        gone.sort_unstable();
        for beacon in gone {
            if let Some(presence) = self.present.remove(&beacon) {
                events.push((EventType::Exit, beacon, presence.reading));
            }
        }
        events
    }

    /// Number of beacons considered present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Returns `true` if no beacon is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Forget every beacon.
    pub fn clear(&mut self) {
        self.present.clear();
    }
}

fn changed(previous: &Reading, current: &Reading, threshold: f64) -> bool {
    if previous.proximity != current.proximity {
        return true;
    }
    // Negative accuracy means the radio could not estimate it.
    previous.accuracy >= 0.0 && current.accuracy >= 0.0 && (previous.accuracy - current.accuracy).abs() >= threshold
}

/// Snapshot of the pipeline for hosts and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OrchestratorStatus {
    /// Whether monitoring is started.
    pub running: bool,
    /// Whether processing is paused.
    pub paused: bool,
    /// Loaded zones.
    pub zones: usize,
    /// Loaded beacons.
    pub beacons: usize,
    /// Compiled triggers.
    pub triggers: usize,
    /// Beacons currently considered present.
    pub present_beacons: usize,
    /// Deferred leaves waiting to fire.
    pub pending_exits: usize,
    /// Regions buffered for the next flush.
    pub pending_regions: usize,
    /// Dispatch counters.
    pub dispatches: DispatchCounters,
}

struct OrchestratorInner {
    engine: TriggerEngine,
    batcher: Arc<RangeBatcher>,
    dispatcher: Arc<dyn ActionDispatcher>,
    registry: ConditionRegistry,
    tracker: Mutex<PresenceTracker>,
    lifecycle: Mutex<Option<CancellationToken>>,
    deferred: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FireDecision>>>,
    stats: Arc<DispatchStats>,
    accuracy_threshold: f64,
}

impl OrchestratorInner {
    fn tracker(&self) -> MutexGuard<'_, PresenceTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process_flush(&self, flush: &[RegionBatch]) {
        if self.engine.is_paused() {
            return;
        }
        let events = self.tracker().classify(flush, self.accuracy_threshold);

        for (kind, beacon, reading) in events {
            let event = BeaconEvent::new(kind, beacon, reading);
            debug!(beacon = %beacon, event = %kind, proximity = %reading.proximity, "beacon event");
            if kind == EventType::Enter {
                self.engine.cancel_pending_exit(beacon);
            }

            match self.engine.handle_event(&event) {
                Ok(EngineOutcome::Fired(decision)) => self.dispatch(decision),
                Ok(outcome) => trace!(beacon = %beacon, event = %kind, ?outcome, "no dispatch"),
                Err(err) => warn!(beacon = %beacon, event = %kind, error = %err, "event not processed"),
            }
        }
    }

    fn dispatch(&self, decision: FireDecision) {
        let (tx, rx) = oneshot::channel();
        let trigger = decision.trigger.clone();
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.dispatch(decision, DispatchCompletion { tx });

        let stats = Arc::clone(&self.stats);
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                stats.record(rx.await, &trigger);
            });
        } else {
            let mut rx = rx;
            match rx.try_recv() {
                Ok(result) => stats.record(Ok(result), &trigger),
                Err(oneshot::error::TryRecvError::Closed) => {
                    stats.abandoned.fetch_add(1, Ordering::Relaxed);
                    warn!(trigger = %trigger, "dispatch abandoned without a result");
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    debug!(trigger = %trigger, "dispatch completion not tracked outside a runtime");
                }
            }
        }
    }

    fn stop(&self) -> bool {
        let Some(token) = self.lifecycle().take() else {
            return false;
        };
        token.cancel();
        let cancelled = self.engine.reset_presence();
        self.tracker().clear();
        self.batcher.clear();
        info!(cancelled_exits = cancelled, "monitoring stopped");
        true
    }
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        if let Some(token) = self.lifecycle().take() {
            token.cancel();
        }
    }
}

/// The beacon event pipeline. Cheap to clone; the last clone stops monitoring
/// when dropped.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Build a pipeline over `zones`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for out-of-range engine settings,
    /// or another [`ConfigError`] if the zones do not compile against `registry`.
    pub fn new(
        config: &EngineConfig,
        zones: &ZoneSet,
        registry: ConditionRegistry,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let index = BeaconIndex::build(zones, &registry)?;
        let (engine, deferred) = TriggerEngine::new(index, config);
        let inner = OrchestratorInner {
            engine,
            batcher: Arc::new(RangeBatcher::new(config.batch_interval())),
            dispatcher,
            registry,
            tracker: Mutex::new(PresenceTracker::new()),
            lifecycle: Mutex::new(None),
            deferred: Arc::new(tokio::sync::Mutex::new(deferred)),
            stats: Arc::new(DispatchStats::default()),
            accuracy_threshold: config.range_accuracy_threshold_m,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start monitoring: spawn the flush loop and the deferred-decision loop.
    /// Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconKitError::RuntimeUnavailable`] outside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| BeaconKitError::RuntimeUnavailable)?;
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.is_some() {
            debug!("monitoring already running");
            return Ok(());
        }
        let token = CancellationToken::new();

        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        Arc::clone(&self.inner.batcher).run(token.clone(), move |flush| {
            if let Some(inner) = weak.upgrade() {
                inner.process_flush(&flush);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let deferred = Arc::clone(&self.inner.deferred);
        let shutdown = token.clone();
        runtime.spawn(async move {
            let mut rx = deferred.lock().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    decision = rx.recv() => {
                        let (Some(decision), Some(inner)) = (decision, weak.upgrade()) else {
                            break;
                        };
                        inner.dispatch(decision);
                    }
                }
            }
        });

        *lifecycle = Some(token);
        info!(
            interval_ms = self.inner.batcher.interval().as_millis(),
            "monitoring started"
        );
        Ok(())
    }

    /// Stop monitoring. Pending leaves are cancelled, presence is forgotten
    /// and buffered samples are dropped. Returns whether monitoring was running.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().is_some()
    }

    /// Keep accepting samples but stop classifying and firing.
    pub fn pause(&self) {
        self.inner.batcher.set_held(true);
        self.inner.engine.set_paused(true);
        info!("monitoring paused");
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) {
        self.inner.engine.set_paused(false);
        self.inner.batcher.set_held(false);
        info!("monitoring resumed");
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.engine.is_paused()
    }

    /// Accept raw samples for `region`. Returns `false` (and drops them) when
    /// monitoring is not running.
    pub fn on_ranged_samples(&self, samples: Vec<RangedSample>, region: impl Into<String>) -> bool {
        if !self.is_running() {
            debug!("samples ignored, monitoring not running");
            return false;
        }
        self.inner.batcher.add(samples, region);
        true
    }

    /// Dispatch the first trigger applicable to `event`, ignoring conditions
    /// and without recording an occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconKitError::UnknownBeacon`] or
    /// [`BeaconKitError::NoApplicableTrigger`].
    pub fn force_fire(&self, beacon: BeaconId, event: EventType) -> Result<FireDecision> {
        let decision = self.inner.engine.force_fire(beacon, event)?;
        self.inner.dispatch(decision.clone());
        Ok(decision)
    }

    /// Replace the zone definitions. The ledger starts over and pending leaves
    /// are cancelled; on error the current zones stay in place.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the zones do not compile.
    pub fn reload(&self, zones: &ZoneSet) -> std::result::Result<(), ConfigError> {
        let index = BeaconIndex::build(zones, &self.inner.registry)?;
        info!(
            zones = index.zone_count(),
            beacons = index.beacon_count(),
            "reloading zone definitions"
        );
        self.inner.engine.reload(index);
        Ok(())
    }

    /// Current pipeline status.
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        let index = self.inner.engine.index();
        OrchestratorStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            zones: index.zone_count(),
            beacons: index.beacon_count(),
            triggers: index.trigger_count(),
            present_beacons: self.inner.tracker().len(),
            pending_exits: self.inner.engine.pending_exits(),
            pending_regions: self.inner.batcher.pending_regions(),
            dispatches: self.inner.stats.snapshot(),
        }
    }

    /// Occurrences recorded for the pair.
    #[must_use]
    pub fn occurrence_count(&self, beacon: BeaconId, trigger: &str) -> u64 {
        self.inner.engine.occurrence_count(beacon, trigger)
    }

    /// Ledger entry for the pair.
    #[must_use]
    pub fn occurrence(&self, beacon: BeaconId, trigger: &str) -> Option<Occurrence> {
        self.inner.engine.occurrence(beacon, trigger)
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &TriggerEngine {
        &self.inner.engine
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}
