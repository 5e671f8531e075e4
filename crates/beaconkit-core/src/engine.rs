//! Trigger evaluation.
//!
//! The engine is handed one stabilized [`BeaconEvent`] at a time and decides
//! whether a trigger fires for it:
//!
//! - `enter` and `range` events are decided immediately. Applicable triggers
//!   are tried in configuration order and the first whose conditions all hold
//!   fires; its occurrence is recorded.
//! - `leave` events are deferred by the configured leave delay. The deferred
//!   callback re-validates at fire time and sends any decision on the channel
//!   returned by [`TriggerEngine::new`]. An `enter` for the beacon must cancel
//!   the pending leave through [`TriggerEngine::cancel_pending_exit`].
//!
//! All ledger and snapshot state sits behind one mutex, so each event is
//! processed atomically with respect to every other. When both are needed the
//! state lock is taken before the scheduler's table lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::condition::{ConditionContext, ConditionEvaluator};
use crate::config::EngineConfig;
use crate::error::{BeaconKitError, Result};
use crate::index::{BeaconIndex, IndexedBeacon, Trigger};
use crate::ledger::{Occurrence, OccurrenceLedger};
use crate::scheduler::{DelayScheduler, ScheduleError};
use crate::types::{BeaconEvent, BeaconId, BeaconSnapshot, EventType};
use crate::zone::ActionRef;

/// A trigger that fired, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FireDecision {
    /// Event that caused the fire.
    pub event_id: Uuid,
    /// Beacon the trigger belongs to.
    pub beacon: BeaconId,
    /// Beacon display name.
    pub beacon_name: String,
    /// Owning zone identifier.
    pub zone: String,
    /// Trigger identifier.
    pub trigger: String,
    /// Trigger display name.
    pub trigger_name: String,
    /// Action to perform.
    pub action: ActionRef,
    /// Event type that fired.
    pub event: EventType,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
    /// Whether conditions were bypassed by a manual fire.
    pub forced: bool,
}

impl FireDecision {
    fn new(beacon: &IndexedBeacon, trigger: &Trigger, event: EventType, event_id: Uuid, forced: bool) -> Self {
        Self {
            event_id,
            beacon: beacon.id(),
            beacon_name: beacon.name(),
            zone: beacon.zone().to_string(),
            trigger: trigger.id().to_string(),
            trigger_name: trigger.name().to_string(),
            action: trigger.action().clone(),
            event,
            decided_at: Utc::now(),
            forced,
        }
    }
}

/// What [`TriggerEngine::handle_event`] did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// A trigger fired.
    Fired(FireDecision),
    /// A leave was scheduled; the decision comes later on the deferred channel.
    Deferred {
        /// Beacon that left.
        beacon: BeaconId,
        /// Delay before re-validation.
        fires_in: Duration,
    },
    /// A leave is already pending for the beacon.
    AlreadyPending,
    /// No applicable trigger validated.
    NoMatch,
    /// The event id was already processed.
    Duplicate,
    /// The engine is paused.
    Paused,
    /// The beacon is not in the loaded zones.
    UnknownBeacon,
}

#[derive(Debug)]
struct RecentEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if `id` was seen within the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug)]
struct EngineState {
    ledger: OccurrenceLedger,
    beacons: HashMap<BeaconId, BeaconSnapshot>,
    recent: RecentEvents,
}

impl EngineState {
    fn new(capacity: usize) -> Self {
        Self {
            ledger: OccurrenceLedger::new(),
            beacons: HashMap::new(),
            recent: RecentEvents::new(capacity),
        }
    }
}

#[derive(Debug)]
struct EngineShared {
    index: RwLock<Arc<BeaconIndex>>,
    state: Mutex<EngineState>,
    scheduler: DelayScheduler<BeaconId>,
    deferred: mpsc::UnboundedSender<FireDecision>,
    leave_delay: Duration,
    recent_capacity: usize,
    paused: AtomicBool,
}

/// Per-event trigger evaluation with deferred leave handling. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TriggerEngine {
    shared: Arc<EngineShared>,
}

impl TriggerEngine {
    /// Create an engine over `index`. Deferred leave decisions arrive on the
    /// returned receiver.
    #[must_use]
    pub fn new(index: BeaconIndex, config: &EngineConfig) -> (Self, mpsc::UnboundedReceiver<FireDecision>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = EngineShared {
            index: RwLock::new(Arc::new(index)),
            state: Mutex::new(EngineState::new(config.recent_event_capacity)),
            scheduler: DelayScheduler::new(),
            deferred: tx,
            leave_delay: config.leave_delay(),
            recent_capacity: config.recent_event_capacity,
            paused: AtomicBool::new(false),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The index currently in use.
    #[must_use]
    pub fn index(&self) -> Arc<BeaconIndex> {
        Arc::clone(&*self.shared.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Process one stabilized event.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconKitError::Scheduling`] if a leave cannot be deferred,
    /// either because no runtime is available or because the leave delay is
    /// too long for the clock.
    pub fn handle_event(&self, event: &BeaconEvent) -> Result<EngineOutcome> {
        if self.is_paused() {
            return Ok(EngineOutcome::Paused);
        }

        let index = self.index();
        let Some(beacon) = index.beacon(event.beacon) else {
            debug!(beacon = %event.beacon, event = %event.kind, "event for unknown beacon ignored");
            return Ok(EngineOutcome::UnknownBeacon);
        };

        let mut guard = self.lock_state();
        let EngineState {
            ledger,
            beacons,
            recent,
        } = &mut *guard;

        if !recent.insert(event.event_id) {
            warn!(beacon = %event.beacon, event_id = %event.event_id, "event already processed");
            return Ok(EngineOutcome::Duplicate);
        }
        update_snapshot(beacons, event);
        let snapshot = beacons.get(&event.beacon);

        if event.kind != EventType::Exit {
            let Some(trigger) = first_match(beacon, event.kind, snapshot, event.observed_at, ledger, true) else {
                debug!(beacon = %event.beacon, event = %event.kind, "no trigger matched");
                return Ok(EngineOutcome::NoMatch);
            };
            let decision = FireDecision::new(beacon, trigger, event.kind, event.event_id, false);
            info!(
                beacon = %decision.beacon,
                trigger = %decision.trigger,
                event = %decision.event,
                action = %decision.action.id,
                "trigger fired"
            );
            return Ok(EngineOutcome::Fired(decision));
        }

        if self.shared.scheduler.is_pending(&event.beacon) {
            debug!(beacon = %event.beacon, "leave already pending");
            return Ok(EngineOutcome::AlreadyPending);
        }
        if first_match(beacon, EventType::Exit, snapshot, event.observed_at, ledger, false).is_none() {
            debug!(beacon = %event.beacon, event = %event.kind, "no trigger matched");
            return Ok(EngineOutcome::NoMatch);
        }

        let shared = Arc::downgrade(&self.shared);
        let event_id = event.event_id;
        let scheduled = self
            .shared
            .scheduler
            .schedule(event.beacon, self.shared.leave_delay, move |beacon| {
                if let Some(shared) = shared.upgrade() {
                    Self { shared }.fire_deferred_exit(beacon, event_id);
                }
            });

        match scheduled {
            Ok(()) => {
                info!(
                    beacon = %event.beacon,
                    delay_secs = self.shared.leave_delay.as_secs_f64(),
                    "leave deferred"
                );
                Ok(EngineOutcome::Deferred {
                    beacon: event.beacon,
                    fires_in: self.shared.leave_delay,
                })
            }
            Err(ScheduleError::AlreadyScheduled { .. }) => {
                warn!(beacon = %event.beacon, "leave scheduled concurrently, keeping the existing one");
                Ok(EngineOutcome::AlreadyPending)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn fire_deferred_exit(&self, beacon_id: BeaconId, event_id: Uuid) {
        if self.is_paused() {
            info!(beacon = %beacon_id, "deferred leave dropped while paused");
            return;
        }

        let index = self.index();
        let Some(beacon) = index.beacon(beacon_id) else {
            return;
        };

        let mut guard = self.lock_state();
        let EngineState { ledger, beacons, .. } = &mut *guard;
        let snapshot = beacons.get(&beacon_id);
        if snapshot.is_some_and(|s| s.present) {
            debug!(beacon = %beacon_id, "beacon is back, deferred leave skipped");
            return;
        }

        let Some(trigger) = first_match(beacon, EventType::Exit, snapshot, Utc::now(), ledger, true) else {
            debug!(beacon = %beacon_id, "deferred leave no longer matches");
            return;
        };
        let decision = FireDecision::new(beacon, trigger, EventType::Exit, event_id, false);
        drop(guard);

        info!(
            beacon = %decision.beacon,
            trigger = %decision.trigger,
            action = %decision.action.id,
            "deferred leave fired"
        );
        if self.shared.deferred.send(decision).is_err() {
            warn!(beacon = %beacon_id, "deferred decision dropped, no receiver");
        }
    }

    /// Cancel the pending leave for `beacon`. Returns whether one was pending.
    pub fn cancel_pending_exit(&self, beacon: BeaconId) -> bool {
        let cancelled = self.shared.scheduler.cancel(&beacon);
        if cancelled {
            info!(beacon = %beacon, "pending leave cancelled");
        }
        cancelled
    }

    /// Returns `true` if a leave is pending for `beacon`.
    #[must_use]
    pub fn has_pending_exit(&self, beacon: BeaconId) -> bool {
        self.shared.scheduler.is_pending(&beacon)
    }

    /// Number of pending leaves.
    #[must_use]
    pub fn pending_exits(&self) -> usize {
        self.shared.scheduler.pending_count()
    }

    /// The trigger that would fire for `event` right now, without recording
    /// anything.
    #[must_use]
    pub fn would_fire(&self, beacon_id: BeaconId, event: EventType) -> Option<String> {
        let index = self.index();
        let beacon = index.beacon(beacon_id)?;
        let mut guard = self.lock_state();
        let EngineState { ledger, beacons, .. } = &mut *guard;
        first_match(beacon, event, beacons.get(&beacon_id), Utc::now(), ledger, false)
            .map(|trigger| trigger.id().to_string())
    }

    /// Build a decision for the first trigger applicable to `event`, ignoring
    /// its conditions. Nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconKitError::UnknownBeacon`] or
    /// [`BeaconKitError::NoApplicableTrigger`].
    pub fn force_fire(&self, beacon_id: BeaconId, event: EventType) -> Result<FireDecision> {
        let index = self.index();
        let beacon = index
            .beacon(beacon_id)
            .ok_or(BeaconKitError::UnknownBeacon(beacon_id))?;
        let trigger = beacon
            .triggers_for(event)
            .next()
            .ok_or(BeaconKitError::NoApplicableTrigger {
                beacon: beacon_id,
                event,
            })?;

        let decision = FireDecision::new(beacon, trigger, event, Uuid::new_v4(), true);
        info!(beacon = %beacon_id, trigger = %decision.trigger, event = %event, "trigger force-fired");
        Ok(decision)
    }

    /// Occurrences recorded for the pair.
    #[must_use]
    pub fn occurrence_count(&self, beacon: BeaconId, trigger: &str) -> u64 {
        self.lock_state().ledger.occurrence_count(beacon, trigger)
    }

    /// Time of the last recorded occurrence for the pair.
    #[must_use]
    pub fn last_occurrence_time(&self, beacon: BeaconId, trigger: &str) -> Option<DateTime<Utc>> {
        self.lock_state().ledger.last_occurrence_time(beacon, trigger)
    }

    /// Ledger entry for the pair.
    #[must_use]
    pub fn occurrence(&self, beacon: BeaconId, trigger: &str) -> Option<Occurrence> {
        self.lock_state().ledger.get(beacon, trigger).copied()
    }

    /// Runtime state of a beacon.
    #[must_use]
    pub fn snapshot(&self, beacon: BeaconId) -> Option<BeaconSnapshot> {
        self.lock_state().beacons.get(&beacon).cloned()
    }

    /// Swap in a new index with a fresh ledger. Pending leaves are cancelled.
    pub fn reload(&self, index: BeaconIndex) {
        let mut state = self.lock_state();
        let cancelled = self.shared.scheduler.cancel_all();
        *self.shared.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
        *state = EngineState::new(self.shared.recent_capacity);
        info!(cancelled, "trigger index reloaded");
    }

    /// Cancel pending leaves and forget beacon snapshots. The ledger is kept.
    pub fn reset_presence(&self) -> usize {
        let mut state = self.lock_state();
        let cancelled = self.shared.scheduler.cancel_all();
        state.beacons.clear();
        cancelled
    }

    /// Pause or resume evaluation.
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }
}

fn update_snapshot(beacons: &mut HashMap<BeaconId, BeaconSnapshot>, event: &BeaconEvent) {
    let snapshot = beacons.entry(event.beacon).or_insert_with(|| BeaconSnapshot {
        reading: event.reading,
        last_seen: event.observed_at,
        entered_at: None,
        present: false,
    });
    snapshot.last_seen = event.observed_at;

    match event.kind {
        EventType::Enter | EventType::Range => {
            snapshot.reading = event.reading;
            if !snapshot.present || snapshot.entered_at.is_none() {
                snapshot.entered_at = Some(event.observed_at);
            }
            snapshot.present = true;
        }
        EventType::Exit => snapshot.present = false,
    }
}

fn first_match<'i>(
    beacon: &'i IndexedBeacon,
    event: EventType,
    snapshot: Option<&BeaconSnapshot>,
    now: DateTime<Utc>,
    ledger: &mut OccurrenceLedger,
    count_occurrence: bool,
) -> Option<&'i Trigger> {
    beacon.triggers_for(event).find(|trigger| {
        let ctx = ConditionContext {
            event,
            beacon: beacon.id(),
            trigger: trigger.id(),
            snapshot,
            now,
        };
        ConditionEvaluator::validate_all(trigger.conditions(), &ctx, ledger, count_occurrence)
    })
}
