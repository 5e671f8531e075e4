//! Occurrence counters per beacon and trigger.
//!
//! The ledger is the only holder of occurrence state. It is a plain value; the
//! trigger engine owns it behind its state lock, which serializes every read
//! and write.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::types::BeaconId;

/// Counted firings of one trigger on one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Occurrence {
    /// Number of recorded occurrences.
    pub count: u64,
    /// Time of the most recent occurrence.
    pub last_at: DateTime<Utc>,
}

/// Per-beacon, per-trigger occurrence counters.
#[derive(Debug, Default)]
pub struct OccurrenceLedger {
    entries: HashMap<BeaconId, HashMap<String, Occurrence>>,
}

impl OccurrenceLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence now. Returns the new count.
    pub fn record_occurrence(&mut self, beacon: BeaconId, trigger: &str) -> u64 {
        self.record_occurrence_at(beacon, trigger, Utc::now())
    }

    /// Record an occurrence at `at`. Returns the new count.
    pub fn record_occurrence_at(&mut self, beacon: BeaconId, trigger: &str, at: DateTime<Utc>) -> u64 {
        let per_beacon = self.entries.entry(beacon).or_default();
        match per_beacon.get_mut(trigger) {
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                entry.last_at = entry.last_at.max(at);
                entry.count
            }
            None => {
                per_beacon.insert(trigger.to_string(), Occurrence { count: 1, last_at: at });
                1
            }
        }
    }

    /// Number of occurrences recorded for the pair.
    #[must_use]
    pub fn occurrence_count(&self, beacon: BeaconId, trigger: &str) -> u64 {
        self.get(beacon, trigger).map_or(0, |o| o.count)
    }

    /// Time of the last occurrence for the pair, if any.
    #[must_use]
    pub fn last_occurrence_time(&self, beacon: BeaconId, trigger: &str) -> Option<DateTime<Utc>> {
        self.get(beacon, trigger).map(|o| o.last_at)
    }

    /// Full entry for the pair, if any.
    #[must_use]
    pub fn get(&self, beacon: BeaconId, trigger: &str) -> Option<&Occurrence> {
        self.entries.get(&beacon).and_then(|m| m.get(trigger))
    }

    /// Number of (beacon, trigger) pairs with at least one occurrence.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
