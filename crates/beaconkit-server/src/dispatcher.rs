//! Built-in action dispatcher.
//!
//! Performs no side effect of its own: each decision is logged and kept in a
//! bounded in-memory history that the `/api/dispatches` endpoint reads.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use beaconkit_core::{ActionDispatcher, DispatchCompletion, FireDecision};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

/// One dispatched decision.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DispatchRecord {
    /// The decision as handed to the dispatcher.
    pub decision: FireDecision,
    /// When the dispatcher received it.
    pub dispatched_at: DateTime<Utc>,
}

/// Logs every decision and remembers the most recent ones.
#[derive(Debug)]
pub struct HistoryDispatcher {
    capacity: usize,
    entries: Mutex<VecDeque<DispatchRecord>>,
}

impl HistoryDispatcher {
    /// Create a dispatcher keeping at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DispatchRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Up to `limit` records, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<DispatchRecord> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing was dispatched yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of records kept.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl ActionDispatcher for HistoryDispatcher {
    fn dispatch(&self, decision: FireDecision, completion: DispatchCompletion) {
        info!(
            beacon = %decision.beacon,
            zone = %decision.zone,
            trigger = %decision.trigger,
            event = %decision.event,
            action = %decision.action.id,
            action_type = %decision.action.kind,
            forced = decision.forced,
            "action dispatched"
        );

        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DispatchRecord {
            decision,
            dispatched_at: Utc::now(),
        });
        drop(entries);

        completion.succeed();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use beaconkit_core::{ConditionRegistry, EngineConfig, EventType, Orchestrator, ZoneSet};
    use serde_json::json;

    use super::*;

    fn orchestrator(dispatcher: Arc<HistoryDispatcher>) -> Orchestrator {
        let doc = json!({
            "id": "hall",
            "beacons": [{
                "proximity_uuid": "f7826da6-4fa2-4e98-8024-bc5b71e0893e",
                "major": 3,
                "minor": 9,
                "triggers": [{ "id": "greet", "action": { "id": "hello", "type": "log" } }]
            }]
        });
        let zones = ZoneSet::from_json_str(&doc.to_string()).unwrap();
        Orchestrator::new(&EngineConfig::default(), &zones, ConditionRegistry::default(), dispatcher).unwrap()
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let history = Arc::new(HistoryDispatcher::new(2));
        let pipeline = orchestrator(Arc::clone(&history));
        let beacon = "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-3-9".parse().unwrap();

        for event in [EventType::Enter, EventType::Range, EventType::Exit] {
            pipeline.force_fire(beacon, event).unwrap();
        }

        assert_eq!(history.len(), 2);
        let recent = history.recent(10);
        assert_eq!(recent[0].decision.event, EventType::Exit);
        assert_eq!(recent[1].decision.event, EventType::Range);
        assert_eq!(history.recent(1).len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_reports_success() {
        let history = Arc::new(HistoryDispatcher::new(4));
        let pipeline = orchestrator(Arc::clone(&history));
        let beacon = "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-3-9".parse().unwrap();

        pipeline.force_fire(beacon, EventType::Enter).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let counters = pipeline.status().dispatches;
        assert_eq!(counters.dispatched, 1);
        assert_eq!(counters.succeeded, 1);
        assert!(!history.is_empty());
    }
}
