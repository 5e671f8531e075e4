//! Range sample batching.
//!
//! Scanning delivers overlapping bursts for several regions at nearly the same
//! time. The batcher keeps only the latest sample list per region and hands the
//! whole batch to a consumer once per flush period. While held, ticks are
//! skipped and samples keep accumulating.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::types::RangedSample;

/// The consolidated samples of one region for one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionBatch {
    /// Region identifier.
    pub region: String,
    /// At most one sample per beacon. Empty means the region saw nothing.
    pub samples: Vec<RangedSample>,
}

/// Last-wins-per-region sample buffer with a periodic flush.
#[derive(Debug)]
pub struct RangeBatcher {
    interval: Duration,
    pending: Mutex<BTreeMap<String, Vec<RangedSample>>>,
    held: AtomicBool,
}

impl RangeBatcher {
    /// Create a batcher that flushes every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Mutex::new(BTreeMap::new()),
            held: AtomicBool::new(false),
        }
    }

    /// Flush period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<RangedSample>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the region's samples for the current window. Callable from any
    /// thread.
    ///
    /// Repeated samples for one beacon within the list keep the last one.
    pub fn add(&self, samples: Vec<RangedSample>, region: impl Into<String>) {
        let region = region.into();
        let samples = dedup_last_wins(samples);
        trace!(region = %region, samples = samples.len(), "range samples buffered");
        self.lock().insert(region, samples);
    }

    /// Take the current batch, leaving the buffer empty.
    ///
    /// Regions come back in identifier order. A beacon reported by several
    /// regions is kept only in the first of them.
    pub fn flush(&self) -> Vec<RegionBatch> {
        let pending = std::mem::take(&mut *self.lock());

        let mut seen = HashSet::new();
        pending
            .into_iter()
            .map(|(region, samples)| {
                let samples = samples
                    .into_iter()
                    .filter(|sample| seen.insert(sample.beacon_id()))
                    .collect();
                RegionBatch { region, samples }
            })
            .collect()
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Stop or resume periodic flushing without dropping buffered samples.
    pub fn set_held(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }

    /// Returns `true` while flushing is held.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Number of regions waiting for the next flush.
    #[must_use]
    pub fn pending_regions(&self) -> usize {
        self.lock().len()
    }

    /// Spawn the periodic flush loop. Non-empty flushes go to `consumer`
    /// until `shutdown` is cancelled.
    pub fn run<F>(self: Arc<Self>, shutdown: CancellationToken, mut consumer: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<RegionBatch>) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("range batcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if self.is_held() {
                            continue;
                        }
                        let batch = self.flush();
                        if !batch.is_empty() {
                            consumer(batch);
                        }
                    }
                }
            }
        })
    }
}

fn dedup_last_wins(samples: Vec<RangedSample>) -> Vec<RangedSample> {
    let mut seen = HashSet::new();
    let mut kept: Vec<RangedSample> = samples
        .into_iter()
        .rev()
        .filter(|sample| seen.insert(sample.beacon_id()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Proximity;
    use uuid::Uuid;

    fn sample(minor: u16, proximity: Proximity, accuracy: f64) -> RangedSample {
        RangedSample {
            proximity_uuid: Uuid::nil(),
            major: 1,
            minor,
            proximity,
            accuracy,
            rssi: -60,
        }
    }

    #[test]
    fn test_last_add_wins_per_region() {
        let batcher = RangeBatcher::new(Duration::from_secs(1));
        batcher.add(vec![sample(1, Proximity::Far, 5.0)], "r1");
        batcher.add(vec![sample(1, Proximity::Near, 1.0)], "r1");

        let batch = batcher.flush();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].samples, vec![sample(1, Proximity::Near, 1.0)]);
        assert!(batcher.flush().is_empty());
    }

    #[test]
    fn test_one_sample_per_beacon_per_flush() {
        let batcher = RangeBatcher::new(Duration::from_secs(1));
        batcher.add(
            vec![
                sample(1, Proximity::Far, 5.0),
                sample(2, Proximity::Near, 1.0),
                sample(1, Proximity::Immediate, 0.2),
            ],
            "a",
        );
        batcher.add(vec![sample(1, Proximity::Far, 7.0)], "b");

        let batch = batcher.flush();
        let all: Vec<_> = batch.iter().flat_map(|r| r.samples.iter()).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(batch[0].samples[1], sample(1, Proximity::Immediate, 0.2));
        assert!(batch[1].samples.is_empty());
    }

    #[test]
    fn test_empty_region_is_delivered() {
        let batcher = RangeBatcher::new(Duration::from_secs(1));
        batcher.add(Vec::new(), "quiet");
        assert_eq!(batcher.pending_regions(), 1);
        let batch = batcher.flush();
        assert_eq!(batch, vec![RegionBatch {
            region: "quiet".to_string(),
            samples: Vec::new()
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_batcher_keeps_samples() {
        let batcher = Arc::new(RangeBatcher::new(Duration::from_millis(100)));
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        batcher.set_held(true);
        let _handle = Arc::clone(&batcher).run(shutdown.clone(), move |batch| {
            let _ = tx.send(batch);
        });

        batcher.add(vec![sample(1, Proximity::Near, 1.0)], "r1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(batcher.pending_regions(), 1);

        batcher.set_held(false);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].samples.len(), 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_periodically_until_cancelled() {
        let batcher = Arc::new(RangeBatcher::new(Duration::from_millis(500)));
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = Arc::clone(&batcher).run(shutdown.clone(), move |batch| {
            let _ = tx.send(batch);
        });

        batcher.add(vec![sample(1, Proximity::Near, 1.0)], "r1");
        batcher.add(vec![sample(2, Proximity::Near, 1.0)], "r1");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].samples[0].minor, 2);

        batcher.add(Vec::new(), "r1");
        let second = rx.recv().await.unwrap();
        assert!(second[0].samples.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
        batcher.add(vec![sample(3, Proximity::Near, 1.0)], "r1");
        assert_eq!(batcher.pending_regions(), 1);
    }
}
