//! Consistency and lag tracking.
//!
//! Workers report the offset they applied through and the broker's high
//! watermark; readers ask whether a partition is caught up to an offset
//! they wrote at (read-your-writes) or how stale it is. State is in memory
//! only and is also published as gauges.

use chrono::{DateTime, Utc};
use staffing_views_core::environment::{Clock, SystemClock};
use staffing_views_core::partition::PartitionId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Progress of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionProgress {
    /// Last log offset applied to the view
    pub applied_offset: Option<u64>,
    /// When the event at `applied_offset` occurred
    pub applied_occurred_at: Option<DateTime<Utc>>,
    /// Offset the next appended record will get, as last observed
    pub high_watermark: Option<u64>,
}

impl PartitionProgress {
    /// Records in the log that are not applied yet.
    #[must_use]
    pub fn offset_lag(&self) -> u64 {
        let next = self.applied_offset.map_or(0, |offset| offset.saturating_add(1));
        self.high_watermark.unwrap_or(next).saturating_sub(next)
    }
}

/// Tracks applied and observed offsets per partition.
#[derive(Clone)]
pub struct LagTracker {
    partitions: Arc<RwLock<HashMap<PartitionId, PartitionProgress>>>,
    clock: Arc<dyn Clock>,
}

impl Default for LagTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LagTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LagTracker")
            .field("partitions", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl LagTracker {
    /// Create a tracker on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a tracker on `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            partitions: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Record that everything up to `offset` is applied.
    ///
    /// `occurred_at` is the occurrence time of the event at `offset`.
    /// Offsets never move backwards.
    pub fn record_applied(&self, partition: &PartitionId, offset: u64, occurred_at: DateTime<Utc>) {
        let progress = self.update(partition, |progress| {
            if progress.applied_offset.is_some_and(|applied| applied >= offset) {
                return;
            }
            progress.applied_offset = Some(offset);
            progress.applied_occurred_at = Some(occurred_at);
            if progress.high_watermark.is_some_and(|hw| hw <= offset) {
                progress.high_watermark = Some(offset.saturating_add(1));
            }
        });
        self.publish(partition, &progress);
    }

    /// Record the log's high watermark.
    pub fn record_observed(&self, partition: &PartitionId, high_watermark: u64) {
        let progress = self.update(partition, |progress| {
            progress.high_watermark = Some(progress.high_watermark.map_or(high_watermark, |hw| hw.max(high_watermark)));
        });
        self.publish(partition, &progress);
    }

    /// Progress of a partition.
    #[must_use]
    pub fn progress(&self, partition: &PartitionId) -> PartitionProgress {
        self.read().get(partition).copied().unwrap_or_default()
    }

    /// Records not yet applied.
    #[must_use]
    pub fn offset_lag(&self, partition: &PartitionId) -> u64 {
        self.progress(partition).offset_lag()
    }

    /// How far behind the log the view is, in time.
    ///
    /// Zero when everything observed is applied. Otherwise the age of the
    /// last applied event; a partition with nothing applied yet reports
    /// zero until a high watermark shows there is work.
    #[must_use]
    pub fn lag(&self, partition: &PartitionId) -> Duration {
        let progress = self.progress(partition);
        if progress.offset_lag() == 0 {
            return Duration::ZERO;
        }
        progress
            .applied_occurred_at
            .and_then(|at| (self.clock.now() - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the record at `offset` is reflected in the view.
    #[must_use]
    pub fn is_caught_up(&self, partition: &PartitionId, offset: u64) -> bool {
        self.progress(partition)
            .applied_offset
            .is_some_and(|applied| applied >= offset)
    }

    /// Progress of every partition seen so far.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<PartitionId, PartitionProgress> {
        self.read().clone()
    }

    fn update(&self, partition: &PartitionId, f: impl FnOnce(&mut PartitionProgress)) -> PartitionProgress {
        let mut partitions = self
            .partitions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let progress = partitions.entry(partition.clone()).or_default();
        f(progress);
        *progress
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PartitionId, PartitionProgress>> {
        self.partitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[allow(clippy::cast_precision_loss)] // Gauges are f64
    fn publish(&self, partition: &PartitionId, progress: &PartitionProgress) {
        let label = partition.to_string();
        metrics::gauge!("view.lag.offsets", "partition" => label.clone()).set(progress.offset_lag() as f64);
        metrics::gauge!("view.lag.seconds", "partition" => label).set(self.lag(partition).as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use staffing_views_testing::{FixedClock, fixtures};

    fn partition() -> PartitionId {
        PartitionId::new("carer-events", 2)
    }

    fn tracker() -> (LagTracker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(fixtures::epoch()));
        (LagTracker::with_clock(clock.clone()), clock)
    }

    #[test]
    fn unknown_partition_is_not_caught_up_and_has_no_lag() {
        let (tracker, _) = tracker();
        assert!(!tracker.is_caught_up(&partition(), 0));
        assert_eq!(tracker.lag(&partition()), Duration::ZERO);
        assert_eq!(tracker.offset_lag(&partition()), 0);
    }

    #[test]
    fn lag_is_age_of_last_applied_event_while_behind() {
        let (tracker, clock) = tracker();
        tracker.record_observed(&partition(), 10);
        tracker.record_applied(&partition(), 3, fixtures::occurred_at(3));
        clock.set(fixtures::occurred_at(3) + chrono::Duration::seconds(42));

        assert_eq!(tracker.offset_lag(&partition()), 6);
        assert_eq!(tracker.lag(&partition()), Duration::from_secs(42));
        assert!(tracker.is_caught_up(&partition(), 3));
        assert!(!tracker.is_caught_up(&partition(), 4));
    }

    #[test]
    fn caught_up_partition_has_zero_lag() {
        let (tracker, clock) = tracker();
        tracker.record_observed(&partition(), 5);
        tracker.record_applied(&partition(), 4, fixtures::occurred_at(4));
        clock.advance(chrono::Duration::minutes(10));

        assert_eq!(tracker.offset_lag(&partition()), 0);
        assert_eq!(tracker.lag(&partition()), Duration::ZERO);
    }

    #[test]
    fn applied_offset_never_moves_backwards() {
        let (tracker, _) = tracker();
        tracker.record_applied(&partition(), 8, fixtures::occurred_at(8));
        tracker.record_applied(&partition(), 2, fixtures::occurred_at(2));

        let progress = tracker.progress(&partition());
        assert_eq!(progress.applied_offset, Some(8));
        assert_eq!(progress.applied_occurred_at, Some(fixtures::occurred_at(8)));
    }

    #[test]
    fn applying_past_watermark_raises_it() {
        let (tracker, _) = tracker();
        tracker.record_observed(&partition(), 3);
        tracker.record_applied(&partition(), 6, fixtures::occurred_at(6));
        assert_eq!(tracker.progress(&partition()).high_watermark, Some(7));
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn applying_without_observed_watermark_does_not_invent_one() {
        let (tracker, _) = tracker();
        tracker.record_applied(&partition(), 6, fixtures::occurred_at(6));
        assert_eq!(tracker.progress(&partition()).high_watermark, None);

        tracker.record_observed(&partition(), 20);
        assert_eq!(tracker.offset_lag(&partition()), 13);
    }

    #[test]
    fn last_possible_offset_saturates() {
        let (tracker, _) = tracker();
        tracker.record_observed(&partition(), 1);
        tracker.record_applied(&partition(), u64::MAX, fixtures::occurred_at(0));
        assert_eq!(tracker.progress(&partition()).high_watermark, Some(u64::MAX));
        assert_eq!(tracker.offset_lag(&partition()), 0);
        assert!(tracker.is_caught_up(&partition(), u64::MAX));
    }
}
