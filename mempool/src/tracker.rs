use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use common::TxHash;

use crate::pools::RemovalReason;

#[derive(Debug, Clone, Copy)]
struct Checkpoints {
    first_seen: Instant,
    entered_queued: Option<Instant>,
    entered_pending: Option<Instant>,
    reached_pending: bool,
}

impl Checkpoints {
    fn new() -> Self {
        Self {
            first_seen: Instant::now(),
            entered_queued: None,
            entered_pending: None,
            reached_pending: false,
        }
    }
}

/// Running count, total and maximum of one latency measure.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricSummary {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl MetricSummary {
    fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;
        if sample > self.max {
            self.max = sample;
        }
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerSnapshot {
    /// Time spent waiting in the gapped bucket, per visit.
    pub queued_dwell: MetricSummary,
    /// Time spent includable, per visit.
    pub pending_dwell: MetricSummary,
    /// Submission to the first promotion.
    pub time_to_pending: MetricSummary,
    /// Submission to block inclusion.
    pub time_to_inclusion: MetricSummary,
}

/// Follows every submitted transaction through its bucket transitions and
/// folds the dwell times into running summaries when it leaves the pool.
#[derive(Default)]
pub struct TxTracker {
    checkpoints: DashMap<TxHash, Checkpoints>,
    stats: Mutex<TrackerSnapshot>,
}

impl TxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts following a hash at submission time. Re-tracking a live hash
    /// keeps the original record.
    pub fn track(&self, hash: TxHash) {
        if self.checkpoints.contains_key(&hash) {
            debug!(%hash, "already tracked");
            return;
        }
        self.checkpoints.insert(hash, Checkpoints::new());
    }

    pub fn entered_queued(&self, hash: &TxHash) {
        let Some(mut cp) = self.checkpoints.get_mut(hash) else {
            return;
        };
        let now = Instant::now();
        if let Some(since) = cp.entered_pending.take() {
            self.record(|stats| &mut stats.pending_dwell, now - since);
        }
        cp.entered_queued.get_or_insert(now);
    }

    pub fn entered_pending(&self, hash: &TxHash) {
        let Some(mut cp) = self.checkpoints.get_mut(hash) else {
            return;
        };
        let now = Instant::now();
        if let Some(since) = cp.entered_queued.take() {
            self.record(|stats| &mut stats.queued_dwell, now - since);
        }
        cp.entered_pending.get_or_insert(now);
        if !cp.reached_pending {
            cp.reached_pending = true;
            self.record(|stats| &mut stats.time_to_pending, now - cp.first_seen);
        }
    }

    /// Folds open dwell times and destroys the record. An `Included` reason
    /// also records the submission-to-inclusion latency.
    pub fn removed(&self, hash: &TxHash, reason: &RemovalReason) {
        let Some((_, cp)) = self.checkpoints.remove(hash) else {
            return;
        };
        let now = Instant::now();
        if let Some(since) = cp.entered_queued {
            self.record(|stats| &mut stats.queued_dwell, now - since);
        }
        if let Some(since) = cp.entered_pending {
            self.record(|stats| &mut stats.pending_dwell, now - since);
        }
        if matches!(reason, RemovalReason::Included) {
            self.record(|stats| &mut stats.time_to_inclusion, now - cp.first_seen);
        }
        debug!(%hash, %reason, lifetime = ?(now - cp.first_seen), "tx lifecycle closed");
    }

    /// Drops a record without folding anything, for submissions the pool
    /// never accepted.
    pub fn forget(&self, hash: &TxHash) {
        self.checkpoints.remove(hash);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record<F>(&self, pick: F, sample: Duration)
    where
        F: FnOnce(&mut TrackerSnapshot) -> &mut MetricSummary,
    {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        pick(&mut stats).record(sample);
    }
}

#[cfg(test)]
impl TxTracker {
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use common::B256;

    use super::*;

    #[test]
    fn test_track_is_idempotent_and_removed_destroys() {
        let tracker = TxTracker::new();
        let hash = B256::repeat_byte(1);
        tracker.track(hash);
        tracker.track(hash);
        assert_eq!(tracker.len(), 1);

        tracker.removed(&hash, &RemovalReason::Requested);
        assert!(tracker.is_empty());
        // events for unknown hashes are ignored
        tracker.entered_pending(&hash);
        assert_eq!(tracker.snapshot().time_to_pending.count, 0);
    }

    #[test]
    fn test_dwell_cycles_fold_per_visit() {
        let tracker = TxTracker::new();
        let hash = B256::repeat_byte(2);
        tracker.track(hash);

        tracker.entered_queued(&hash);
        tracker.entered_pending(&hash);
        tracker.entered_queued(&hash);
        tracker.entered_pending(&hash);
        tracker.removed(&hash, &RemovalReason::Requested);

        let stats = tracker.snapshot();
        assert_eq!(stats.queued_dwell.count, 2);
        assert_eq!(stats.pending_dwell.count, 2);
        // the first promotion only counts once
        assert_eq!(stats.time_to_pending.count, 1);
        assert_eq!(stats.time_to_inclusion.count, 0);
    }

    #[test]
    fn test_inclusion_latency_recorded() {
        let tracker = TxTracker::new();
        let hash = B256::repeat_byte(3);
        tracker.track(hash);
        tracker.entered_pending(&hash);
        tracker.removed(&hash, &RemovalReason::Included);

        let stats = tracker.snapshot();
        assert_eq!(stats.time_to_inclusion.count, 1);
        assert_eq!(stats.pending_dwell.count, 1);
        assert!(stats.time_to_pending.mean() <= stats.time_to_inclusion.max);
    }
}
