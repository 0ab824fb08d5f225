//! Idempotent projection applier.
//!
//! Folds one event at a time into the row of its aggregate, enforcing the
//! sequencing contract:
//!
//! | stored row            | incoming `seq`       | action                        |
//! |-----------------------|----------------------|-------------------------------|
//! | absent                | `0`                  | create row                    |
//! | `last_applied = n`    | `n + 1`              | fold, advance to `n + 1`      |
//! | `last_applied = n`    | `<= n`               | duplicate, no-op              |
//! | absent / `n`          | anything else        | gap: park, `OutOfOrder`       |
//!
//! Parked events are released in order as soon as their predecessor is
//! applied. Each successful fold is exactly one compare-and-swap upsert on
//! the [`ViewStore`].

use crate::reorder::{BufferedEvent, Insert, ReorderBuffer};
use staffing_views_core::environment::{Clock, SystemClock};
use staffing_views_core::event::DomainEvent;
use staffing_views_core::fold::{self, FoldError};
use staffing_views_core::projection::{ProjectionRow, StoreError, UpsertOutcome, ViewStore};
use staffing_views_runtime::retry::{RetryError, RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;

/// Errors from [`ProjectionApplier::apply`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    /// The event is ahead of the row; it was parked until its predecessor
    /// is applied.
    #[error("Out of order event for {aggregate_id}: expected sequence {expected}, got {received}")]
    OutOfOrder {
        /// Aggregate of the event
        aggregate_id: String,
        /// Sequence the row needs next
        expected: u64,
        /// Sequence that arrived
        received: u64,
    },

    /// The event is ahead of the row and the reorder buffer has no room.
    #[error("Reorder buffer full ({capacity} events), cannot park {aggregate_id} seq {sequence}")]
    BufferFull {
        /// Aggregate of the event
        aggregate_id: String,
        /// Sequence of the event
        sequence: u64,
        /// Buffer capacity
        capacity: usize,
    },

    /// The payload does not fit its event type.
    #[error(transparent)]
    InvalidPayload(#[from] FoldError),

    /// The view store kept failing.
    #[error("Storage failure after {attempts} attempt(s): {source}")]
    StorageFailure {
        /// Attempts made
        attempts: usize,
        /// Last storage error
        source: StoreError,
    },
}

impl From<RetryError<StoreError>> for ApplyError {
    fn from(err: RetryError<StoreError>) -> Self {
        Self::StorageFailure {
            attempts: err.attempts,
            source: err.last_error,
        }
    }
}

/// What happened to an event that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new row was created
    Created,
    /// The event was folded into an existing row
    Folded,
    /// The row already covered this sequence; nothing was written
    Duplicate,
}

/// A previously parked event that was applied (or rejected) after its
/// predecessor arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedEvent {
    /// The released event
    pub event: DomainEvent,
    /// Log offset it was read at
    pub offset: Option<u64>,
    /// Outcome of applying it
    pub result: Result<Applied, ApplyError>,
}

/// Result of a successful [`ProjectionApplier::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// Outcome for the event passed in
    pub applied: Applied,
    /// Parked successors released by it, in sequence order
    pub released: Vec<ReleasedEvent>,
}

/// Applier tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplierSettings {
    /// Maximum number of parked events per partition
    pub reorder_capacity: usize,
    /// How long an event may stay parked before it is escalated
    pub reorder_timeout: Duration,
    /// Retry policy for view-store reads and writes
    pub storage_retry: RetryPolicy,
}

impl Default for ApplierSettings {
    fn default() -> Self {
        Self {
            reorder_capacity: 1_000,
            reorder_timeout: Duration::from_secs(30),
            storage_retry: RetryPolicy::builder().max_retries(5).jitter(true).build(),
        }
    }
}

/// Folds events into projection rows, one partition's worth at a time.
///
/// Not shared: each partition worker owns one applier, and with it the
/// reorder buffer of that partition.
pub struct ProjectionApplier {
    store: Arc<dyn ViewStore>,
    clock: Arc<dyn Clock>,
    settings: ApplierSettings,
    buffer: ReorderBuffer,
}

impl ProjectionApplier {
    /// Create an applier writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ViewStore>, settings: ApplierSettings) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            buffer: ReorderBuffer::new(settings.reorder_capacity),
            settings,
        }
    }

    /// Use `clock` for row timestamps and reorder timeouts.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply an event that did not come from a log.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::OutOfOrder`]: a gap; the event is parked
    /// - [`ApplyError::BufferFull`]: a gap and no room to park it
    /// - [`ApplyError::InvalidPayload`]: the fold rule rejected the payload
    /// - [`ApplyError::StorageFailure`]: the view store kept failing
    pub async fn apply(&mut self, event: &DomainEvent) -> Result<ApplyReport, ApplyError> {
        self.apply_at(event, None).await
    }

    /// Apply an event read at `offset` of the partition log.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply).
    pub async fn apply_record(
        &mut self,
        event: &DomainEvent,
        offset: u64,
    ) -> Result<ApplyReport, ApplyError> {
        self.apply_at(event, Some(offset)).await
    }

    async fn apply_at(
        &mut self,
        event: &DomainEvent,
        offset: Option<u64>,
    ) -> Result<ApplyReport, ApplyError> {
        match self.apply_one(event).await {
            Ok((applied, last_applied)) => {
                let released = self
                    .release_successors(&event.aggregate_id, last_applied)
                    .await;
                Ok(ApplyReport { applied, released })
            }
            Err(ApplyError::OutOfOrder {
                aggregate_id,
                expected,
                received,
            }) => {
                let parked = BufferedEvent {
                    event: event.clone(),
                    offset,
                    buffered_at: self.clock.now(),
                };
                match self.buffer.insert(parked) {
                    Insert::Buffered | Insert::AlreadyBuffered => {
                        tracing::debug!(
                            aggregate_id = %aggregate_id,
                            expected,
                            received,
                            buffered = self.buffer.len(),
                            "Parked out-of-order event"
                        );
                        Err(ApplyError::OutOfOrder {
                            aggregate_id,
                            expected,
                            received,
                        })
                    }
                    Insert::Full => Err(ApplyError::BufferFull {
                        aggregate_id,
                        sequence: received,
                        capacity: self.buffer.capacity(),
                    }),
                }
            }
            Err(other) => Err(other),
        }
    }

    // Returns the outcome and the row's last applied sequence afterwards.
    async fn apply_one(&self, event: &DomainEvent) -> Result<(Applied, u64), ApplyError> {
        let seq = event.sequence_number;
        let current = self.load(&event.aggregate_id).await?;

        let next = match current {
            None if seq == 0 => {
                let derived = fold::fold(None, event)?;
                let mut row = ProjectionRow::new(event.aggregate_id.clone(), 0, derived);
                row.tombstoned = event.event_type.is_tombstone();
                row.updated_at = self.clock.now();
                (Applied::Created, row)
            }
            None => {
                return Err(ApplyError::OutOfOrder {
                    aggregate_id: event.aggregate_id.clone(),
                    expected: 0,
                    received: seq,
                });
            }
            Some(row) if seq <= row.last_applied_sequence => {
                return Ok((Applied::Duplicate, row.last_applied_sequence));
            }
            Some(row) if row.last_applied_sequence.checked_add(1) == Some(seq) => {
                // A tombstoned row only advances its sequence.
                let derived = if row.tombstoned {
                    row.derived_fields
                } else {
                    fold::fold(Some(&row.derived_fields), event)?
                };
                let next = ProjectionRow {
                    aggregate_id: row.aggregate_id,
                    last_applied_sequence: seq,
                    derived_fields: derived,
                    tombstoned: row.tombstoned || event.event_type.is_tombstone(),
                    updated_at: self.clock.now(),
                };
                (Applied::Folded, next)
            }
            Some(row) => {
                return Err(ApplyError::OutOfOrder {
                    aggregate_id: event.aggregate_id.clone(),
                    expected: row.last_applied_sequence.saturating_add(1),
                    received: seq,
                });
            }
        };

        let (applied, row) = next;
        match self.write(row).await? {
            UpsertOutcome::Written => Ok((applied, seq)),
            UpsertOutcome::Stale => {
                tracing::warn!(
                    aggregate_id = %event.aggregate_id,
                    sequence = seq,
                    "Row advanced concurrently, treating event as duplicate"
                );
                Ok((Applied::Duplicate, seq))
            }
        }
    }

    async fn release_successors(&mut self, aggregate_id: &str, mut last_applied: u64) -> Vec<ReleasedEvent> {
        let mut released = Vec::new();

        loop {
            self.buffer.discard_through(aggregate_id, last_applied);
            // Nothing can follow u64::MAX.
            let Some(parked) = last_applied
                .checked_add(1)
                .and_then(|next| self.buffer.take(aggregate_id, next))
            else {
                break;
            };

            let result = self.apply_one(&parked.event).await;
            match result {
                Ok((applied, last)) => {
                    last_applied = last;
                    released.push(ReleasedEvent {
                        event: parked.event,
                        offset: parked.offset,
                        result: Ok(applied),
                    });
                }
                Err(err) => {
                    if matches!(err, ApplyError::StorageFailure { .. }) {
                        // Keep it parked so the low-water offset still covers it.
                        self.buffer.insert(parked.clone());
                    }
                    released.push(ReleasedEvent {
                        event: parked.event,
                        offset: parked.offset,
                        result: Err(err),
                    });
                    break;
                }
            }
        }

        if !released.is_empty() {
            tracing::debug!(
                aggregate_id,
                released = released.len(),
                up_to = last_applied,
                "Released parked events"
            );
        }
        released
    }

    async fn load(&self, aggregate_id: &str) -> Result<Option<ProjectionRow>, ApplyError> {
        let row = retry_with_predicate(
            &self.settings.storage_retry,
            "view_store.get",
            || self.store.get(aggregate_id),
            is_transient,
        )
        .await?;
        Ok(row)
    }

    async fn write(&self, row: ProjectionRow) -> Result<UpsertOutcome, ApplyError> {
        let outcome = retry_with_predicate(
            &self.settings.storage_retry,
            "view_store.upsert",
            || self.store.upsert(row.clone()),
            is_transient,
        )
        .await?;
        Ok(outcome)
    }

    /// Remove and return parked events older than the reorder timeout.
    pub fn expire_stale(&mut self) -> Vec<BufferedEvent> {
        self.buffer
            .expire(self.clock.now(), self.settings.reorder_timeout)
    }

    /// Lowest log offset still parked, if any.
    #[must_use]
    pub fn lowest_buffered_offset(&self) -> Option<u64> {
        self.buffer.lowest_offset()
    }

    /// Number of parked events.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn is_transient(err: &StoreError) -> bool {
    matches!(err, StoreError::Backend(_))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use staffing_views_core::event::EventType;
    use futures::stream::BoxStream;
    use staffing_views_core::projection::{Result as StoreResult, ViewFilter};
    use staffing_views_testing::{InMemoryViewStore, fixtures, test_clock};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    fn applier(store: &InMemoryViewStore) -> ProjectionApplier {
        let settings = ApplierSettings {
            reorder_capacity: 4,
            reorder_timeout: Duration::from_secs(10),
            storage_retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .build(),
        };
        ProjectionApplier::new(Arc::new(store.clone()), settings)
    }

    fn modified(id: &str, seq: u64, status: &str) -> DomainEvent {
        fixtures::event(id, seq, EventType::BookingModified, json!({ "status": status }))
    }

    #[tokio::test]
    async fn booked_then_confirmed_scenario() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);

        let created = fixtures::event("A1", 0, EventType::BookingCreated, json!({ "status": "booked" }));
        assert_eq!(applier.apply(&created).await.unwrap().applied, Applied::Created);
        assert_eq!(
            applier.apply(&modified("A1", 1, "confirmed")).await.unwrap().applied,
            Applied::Folded
        );

        let row = store.row("A1").unwrap();
        assert_eq!(row.last_applied_sequence, 1);
        assert_eq!(serde_json::Value::Object(row.derived_fields), json!({ "status": "confirmed" }));
    }

    #[tokio::test]
    async fn redelivered_first_event_leaves_row_unchanged() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);
        let created = fixtures::event("A1", 0, EventType::BookingCreated, json!({ "status": "booked" }));

        applier.apply(&created).await.unwrap();
        applier.apply(&modified("A1", 1, "confirmed")).await.unwrap();
        let before = store.row("A1").unwrap();
        let writes = store.upsert_calls();

        let report = applier.apply(&created).await.unwrap();
        assert_eq!(report.applied, Applied::Duplicate);
        assert_eq!(store.row("A1").unwrap(), before);
        assert_eq!(store.upsert_calls(), writes);
    }

    #[tokio::test]
    async fn gap_is_parked_then_released_in_order() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);
        applier
            .apply(&fixtures::event("A1", 0, EventType::BookingCreated, json!({})))
            .await
            .unwrap();

        let early = modified("A1", 2, "second");
        let err = applier.apply_record(&early, 7).await.unwrap_err();
        assert_eq!(
            err,
            ApplyError::OutOfOrder {
                aggregate_id: "A1".to_string(),
                expected: 1,
                received: 2,
            }
        );
        assert_eq!(store.row("A1").unwrap().last_applied_sequence, 0);
        assert_eq!(applier.lowest_buffered_offset(), Some(7));

        let report = applier.apply_record(&modified("A1", 1, "first"), 8).await.unwrap();
        assert_eq!(report.applied, Applied::Folded);
        assert_eq!(report.released.len(), 1);
        assert_eq!(report.released[0].offset, Some(7));
        assert_eq!(report.released[0].result, Ok(Applied::Folded));

        let row = store.row("A1").unwrap();
        assert_eq!(row.last_applied_sequence, 2);
        assert_eq!(row.derived_fields["status"], "second");
        assert_eq!(applier.buffered(), 0);
    }

    #[tokio::test]
    async fn first_event_missing_is_a_gap() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);

        let err = applier.apply(&modified("B7", 1, "x")).await.unwrap_err();
        assert!(matches!(err, ApplyError::OutOfOrder { expected: 0, received: 1, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn full_buffer_rejects_without_parking() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);

        for seq in 1..=4 {
            let _ = applier.apply(&modified("Z", seq, "x")).await;
        }
        let err = applier.apply(&modified("Z", 5, "x")).await.unwrap_err();
        assert_eq!(
            err,
            ApplyError::BufferFull {
                aggregate_id: "Z".to_string(),
                sequence: 5,
                capacity: 4,
            }
        );
        assert_eq!(applier.buffered(), 4);
    }

    #[tokio::test]
    async fn stale_parked_events_expire() {
        let store = InMemoryViewStore::new();
        let clock = Arc::new(test_clock());
        let mut applier = applier(&store).with_clock(clock.clone());

        let _ = applier.apply_record(&modified("A1", 3, "x"), 12).await;
        assert!(applier.expire_stale().is_empty());

        clock.advance(chrono::Duration::seconds(11));
        let expired = applier.expire_stale();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].offset, Some(12));
        assert_eq!(applier.lowest_buffered_offset(), None);
    }

    #[tokio::test]
    async fn transient_storage_errors_are_retried() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);
        store.fail_next_upserts(2);

        let created = fixtures::event("A1", 0, EventType::BookingCreated, json!({}));
        applier.apply(&created).await.unwrap();
        assert_eq!(store.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn persistent_storage_errors_surface() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);
        store.fail_next_upserts(10);

        let created = fixtures::event("A1", 0, EventType::BookingCreated, json!({}));
        let err = applier.apply(&created).await.unwrap_err();
        assert!(matches!(err, ApplyError::StorageFailure { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);

        let created = fixtures::event("A1", 0, EventType::BookingCreated, json!([1, 2, 3]));
        let err = applier.apply(&created).await.unwrap_err();
        assert!(matches!(err, ApplyError::InvalidPayload(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancellation_tombstones_and_later_events_only_advance() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);

        applier
            .apply(&fixtures::booking_created("B1", "RN", "Leeds", &[]))
            .await
            .unwrap();
        applier.apply(&fixtures::booking_cancelled("B1", 1)).await.unwrap();
        let cancelled = store.row("B1").unwrap();
        assert!(cancelled.tombstoned);
        assert_eq!(cancelled.field_str("status"), Some("CANCELLED"));

        applier.apply(&fixtures::booking_booked("B1", 2, "C1")).await.unwrap();
        let row = store.row("B1").unwrap();
        assert_eq!(row.last_applied_sequence, 2);
        assert_eq!(row.derived_fields, cancelled.derived_fields);
    }

    #[tokio::test]
    async fn last_possible_sequence_applies_without_overflow() {
        let store = InMemoryViewStore::new();
        let mut applier = applier(&store);
        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), json!("OPEN"));
        store
            .upsert(ProjectionRow::new("A1", u64::MAX - 1, fields))
            .await
            .unwrap();

        let last = modified("A1", u64::MAX, "final");
        let report = applier.apply(&last).await.unwrap();
        assert_eq!(report.applied, Applied::Folded);
        assert!(report.released.is_empty());
        assert_eq!(store.row("A1").unwrap().last_applied_sequence, u64::MAX);

        let again = applier.apply(&last).await.unwrap();
        assert_eq!(again.applied, Applied::Duplicate);
    }

    /// Lets a rival writer advance the row right after the next read.
    struct RacingStore {
        inner: InMemoryViewStore,
        rival: Mutex<Option<ProjectionRow>>,
    }

    impl ViewStore for RacingStore {
        fn upsert(
            &self,
            row: ProjectionRow,
        ) -> Pin<Box<dyn Future<Output = StoreResult<UpsertOutcome>> + Send + '_>> {
            self.inner.upsert(row)
        }

        fn get(
            &self,
            aggregate_id: &str,
        ) -> Pin<Box<dyn Future<Output = StoreResult<Option<ProjectionRow>>> + Send + '_>> {
            let aggregate_id = aggregate_id.to_string();
            Box::pin(async move {
                let current = self.inner.get(&aggregate_id).await?;
                let rival = self.rival.lock().unwrap().take();
                if let Some(rival) = rival {
                    self.inner.upsert(rival).await?;
                }
                Ok(current)
            })
        }

        fn query(&self, filter: ViewFilter) -> BoxStream<'_, StoreResult<ProjectionRow>> {
            self.inner.query(filter)
        }

        fn clear(&self) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
            self.inner.clear()
        }
    }

    #[tokio::test]
    async fn concurrent_writer_wins_and_parked_successor_still_applies() {
        let inner = InMemoryViewStore::new();
        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            rival: Mutex::new(None),
        });
        let settings = ApplierSettings {
            reorder_capacity: 4,
            ..ApplierSettings::default()
        };
        let mut applier = ProjectionApplier::new(racing.clone(), settings);

        applier
            .apply(&fixtures::event("A1", 0, EventType::BookingCreated, json!({})))
            .await
            .unwrap();
        let early = modified("A1", 2, "second");
        assert!(applier.apply_record(&early, 9).await.is_err());

        let mut rival_fields = serde_json::Map::new();
        rival_fields.insert("status".to_string(), json!("rival"));
        rival_fields.insert("by".to_string(), json!("other-worker"));
        let rival = ProjectionRow::new("A1", 1, rival_fields);
        *racing.rival.lock().unwrap() = Some(rival);

        let ours = fixtures::event(
            "A1",
            1,
            EventType::BookingModified,
            json!({ "status": "first", "note": "ours" }),
        );
        let report = applier.apply_record(&ours, 10).await.unwrap();

        assert_eq!(report.applied, Applied::Duplicate);
        assert_eq!(report.released.len(), 1);
        assert_eq!(report.released[0].offset, Some(9));
        assert_eq!(report.released[0].result, Ok(Applied::Folded));

        let row = inner.row("A1").unwrap();
        assert_eq!(row.last_applied_sequence, 2);
        assert_eq!(row.derived_fields["status"], "second");
        assert_eq!(row.derived_fields["by"], "other-worker");
        assert!(!row.derived_fields.contains_key("note"));
        assert_eq!(applier.buffered(), 0);
    }
}
