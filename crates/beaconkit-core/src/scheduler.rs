//! Single-slot delayed callbacks keyed by an identifier.
//!
//! Used to defer "leave" decisions so that a beacon which drops out briefly and
//! comes back does not fire a spurious leave action. Each key has at most one
//! pending entry; scheduling over an existing entry is rejected.
//!
//! Firing and cancelling are serialized on the pending table: a timer claims
//! its entry under the lock before running the callback, so once a callback
//! has started `cancel` for that key returns `false`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Errors returned by [`DelayScheduler::schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The key already has a pending entry; cancel it first.
    #[error("an event is already scheduled for '{key}'")]
    AlreadyScheduled {
        /// Display form of the conflicting key.
        key: String,
    },

    /// The delay does not fit the timer's clock.
    #[error("delay of {delay:?} is too long to schedule")]
    DelayOutOfRange {
        /// The rejected delay.
        delay: Duration,
    },

    /// No Tokio runtime is available to arm the timer.
    #[error("no async runtime available to arm the timer")]
    RuntimeUnavailable,
}

struct PendingEntry {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct PendingTable<K> {
    entries: HashMap<K, PendingEntry>,
    next_ticket: u64,
}

/// Keyed one-shot timers with at most one pending entry per key.
pub struct DelayScheduler<K> {
    table: Arc<Mutex<PendingTable<K>>>,
}

fn lock<K>(table: &Mutex<PendingTable<K>>) -> MutexGuard<'_, PendingTable<K>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> DelayScheduler<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
{
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(PendingTable {
                entries: HashMap::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Arm a timer that calls `callback(key)` once `delay` has elapsed.
    ///
    /// The callback runs on a Tokio worker and must not block.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::AlreadyScheduled`] if `key` is already pending,
    /// [`ScheduleError::DelayOutOfRange`] if `delay` overflows the clock, or
    /// [`ScheduleError::RuntimeUnavailable`] outside a Tokio runtime.
    pub fn schedule<F>(&self, key: K, delay: Duration, callback: F) -> Result<(), ScheduleError>
    where
        F: FnOnce(K) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ScheduleError::RuntimeUnavailable)?;
        let fire_at = Instant::now()
            .checked_add(delay)
            .ok_or(ScheduleError::DelayOutOfRange { delay })?;

        let mut table = lock(&self.table);
        if table.entries.contains_key(&key) {
            return Err(ScheduleError::AlreadyScheduled {
                key: key.to_string(),
            });
        }

        let ticket = table.next_ticket;
        table.next_ticket = table.next_ticket.wrapping_add(1);

        let weak: Weak<Mutex<PendingTable<K>>> = Arc::downgrade(&self.table);
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(fire_at).await;

            let Some(table) = weak.upgrade() else {
                return;
            };
            let claimed = {
                let mut table = lock(&table);
                match table.entries.get(&task_key) {
                    Some(entry) if entry.ticket == ticket => {
                        table.entries.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                debug!(key = %task_key, "delayed event firing");
                callback(task_key);
            }
        });

        table.entries.insert(
            key,
            PendingEntry {
                ticket,
                handle,
            },
        );
        Ok(())
    }

    /// Remove the pending entry for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = lock(&self.table).entries.remove(key);
        match removed {
            Some(entry) => {
                entry.handle.abort();
                debug!(key = %key, "delayed event cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending entry. Returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = lock(&self.table).entries.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    /// Returns `true` if `key` has a pending entry.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.table).entries.contains_key(key)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.table).entries.len()
    }
}

impl<K> Default for DelayScheduler<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for DelayScheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("pending", &lock(&self.table).entries.len())
            .finish()
    }
}

impl<K> Drop for DelayScheduler<K> {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.table).entries.drain() {
            entry.handle.abort();
        }
    }
}
