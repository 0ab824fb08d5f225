//! End-to-end pipeline tests on in-memory doubles.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use futures::stream::BoxStream;
use serde_json::json;
use staffing_views_core::dead_letter::FailureKind;
use staffing_views_core::event::EventType;
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::{
    ProjectionRow, Result as StoreResult, StoreError, UpsertOutcome, ViewFilter, ViewStore,
};
use staffing_views_projections::{
    LagTracker, PipelineHandles, PipelineSettings, RunOutcome, ViewMaintenance, WorkerError,
};
use staffing_views_runtime::RetryPolicy;
use staffing_views_testing::{
    FixedClock, InMemoryDeadLetterSink, InMemoryEventLog, InMemoryOffsetStore, InMemoryViewStore,
    fixtures, init_test_tracing, test_clock,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

fn bookings(partition: u32) -> PartitionId {
    PartitionId::new("booking-events", partition)
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(2)
        .initial_delay(Duration::from_millis(1))
        .build()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 4,
        idle_poll_interval: Duration::from_millis(5),
        reorder_capacity: 16,
        reorder_timeout: Duration::from_secs(5),
        poison_retries: 1,
        fetch_retry: quick_retry(),
        storage_retry: quick_retry(),
    }
}

struct Harness {
    log: InMemoryEventLog,
    views: InMemoryViewStore,
    offsets: InMemoryOffsetStore,
    dead_letters: InMemoryDeadLetterSink,
    clock: Arc<FixedClock>,
    lag: LagTracker,
}

impl Harness {
    fn new() -> Self {
        init_test_tracing();
        let clock = Arc::new(test_clock());
        Self {
            log: InMemoryEventLog::new(),
            views: InMemoryViewStore::new(),
            offsets: InMemoryOffsetStore::new(),
            dead_letters: InMemoryDeadLetterSink::new(),
            lag: LagTracker::with_clock(clock.clone()),
            clock,
        }
    }

    fn handles(&self, views: Arc<dyn ViewStore>) -> PipelineHandles {
        PipelineHandles {
            log: Arc::new(self.log.clone()),
            views,
            offsets: Arc::new(self.offsets.clone()),
            dead_letters: Arc::new(self.dead_letters.clone()),
            lag: self.lag.clone(),
        }
    }

    fn pipeline(&self, partitions: Vec<PartitionId>) -> ViewMaintenance {
        self.pipeline_on(Arc::new(self.views.clone()), partitions)
    }

    fn pipeline_on(&self, views: Arc<dyn ViewStore>, partitions: Vec<PartitionId>) -> ViewMaintenance {
        ViewMaintenance::new(self.handles(views), partitions, settings()).with_clock(self.clock.clone())
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `pipeline` until `done` holds, then shut it down.
async fn run_until(pipeline: ViewMaintenance, what: &str, done: impl FnMut() -> bool) -> RunOutcome {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(async move { pipeline.run(shutdown_rx).await });

    wait_until(what, done).await;
    shutdown_tx.send(true).expect("pipeline dropped its receiver");
    running.await.expect("pipeline task panicked")
}

#[tokio::test]
async fn booked_then_confirmed_lands_in_view() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::event("A1", 0, EventType::BookingCreated, json!({ "status": "booked" })));
    h.log.push_event(&p, &fixtures::event("A1", 1, EventType::BookingModified, json!({ "status": "confirmed" })));

    let offsets = h.offsets.clone();
    let outcome = run_until(h.pipeline(vec![p.clone()]), "checkpoint 1", || {
        offsets.committed(&bookings(0)) == Some(1)
    })
    .await;

    assert!(outcome.is_clean());
    let row = h.views.row("A1").unwrap();
    assert_eq!(row.aggregate_id, "A1");
    assert_eq!(row.last_applied_sequence, 1);
    assert_eq!(serde_json::Value::Object(row.derived_fields), json!({ "status": "confirmed" }));
    assert_eq!(outcome.stopped[0].applied, 2);
}

#[tokio::test]
async fn redelivered_event_leaves_row_unchanged() {
    let h = Harness::new();
    let p = bookings(0);
    let created = fixtures::event("A1", 0, EventType::BookingCreated, json!({ "status": "booked" }));
    h.log.push_event(&p, &created);
    h.log.push_event(&p, &fixtures::event("A1", 1, EventType::BookingModified, json!({ "status": "confirmed" })));
    h.log.push_event(&p, &created);

    let offsets = h.offsets.clone();
    let outcome = run_until(h.pipeline(vec![p.clone()]), "checkpoint 2", || {
        offsets.committed(&bookings(0)) == Some(2)
    })
    .await;

    let row = h.views.row("A1").unwrap();
    assert_eq!(row.last_applied_sequence, 1);
    assert_eq!(row.derived_fields["status"], "confirmed");
    assert_eq!(outcome.stopped[0].duplicates, 1);
    assert_eq!(h.views.upsert_calls(), 2);
}

#[tokio::test]
async fn malformed_record_is_dead_lettered_and_partition_continues() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::booking_created("B1", "RN", "Leeds", &[]));
    h.log.push_raw(&p, "B1", b"not an envelope".to_vec());
    h.log.push_event(&p, &fixtures::booking_booked("B1", 1, "C7"));

    let offsets = h.offsets.clone();
    let outcome = run_until(h.pipeline(vec![p.clone()]), "checkpoint 2", || {
        offsets.committed(&bookings(0)) == Some(2)
    })
    .await;

    let row = h.views.row("B1").unwrap();
    assert_eq!(row.last_applied_sequence, 1);
    assert_eq!(row.field_str("status"), Some("BOOKED"));
    assert_eq!(row.field_str("carer_id"), Some("C7"));

    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, FailureKind::Decode);
    assert_eq!(letters[0].offset, 1);
    assert_eq!(letters[0].retry_count, 2);
    assert_eq!(outcome.stopped[0].dead_lettered, 1);
}

#[tokio::test]
async fn payload_of_wrong_shape_is_dead_lettered() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::event("B1", 0, EventType::BookingCreated, json!("just a string")));
    h.log.push_event(&p, &fixtures::booking_created("B2", "HCA", "York", &[]));

    let offsets = h.offsets.clone();
    run_until(h.pipeline(vec![p.clone()]), "checkpoint 1", || {
        offsets.committed(&bookings(0)) == Some(1)
    })
    .await;

    assert!(h.views.row("B1").is_none());
    assert!(h.views.row("B2").is_some());
    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, FailureKind::InvalidPayload);
    assert_eq!(letters[0].aggregate_id.as_deref(), Some("B1"));
}

#[tokio::test]
async fn out_of_order_delivery_is_buffered_then_applied() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::event("A1", 0, EventType::BookingCreated, json!({})));
    h.log.push_event(&p, &fixtures::event("A1", 2, EventType::BookingModified, json!({ "step": 2 })));
    h.log.push_event(&p, &fixtures::event("A1", 1, EventType::BookingModified, json!({ "step": 1 })));

    let offsets = h.offsets.clone();
    let lag = h.lag.clone();
    run_until(h.pipeline(vec![p.clone()]), "caught up", || {
        offsets.committed(&bookings(0)) == Some(2) && lag.progress(&bookings(0)).high_watermark == Some(3)
    })
    .await;

    let row = h.views.row("A1").unwrap();
    assert_eq!(row.last_applied_sequence, 2);
    assert_eq!(row.derived_fields["step"], 2);
    assert!(h.dead_letters.letters().is_empty());

    assert!(h.lag.is_caught_up(&p, 2));
    assert_eq!(h.lag.offset_lag(&p), 0);
    assert_eq!(h.lag.lag(&p), Duration::ZERO);
}

#[tokio::test]
async fn parked_event_times_out_into_dead_letters() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::event("A1", 0, EventType::BookingCreated, json!({})));
    h.log.push_event(&p, &fixtures::event("A1", 2, EventType::BookingModified, json!({})));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = h.pipeline(vec![p.clone()]);
    let running = tokio::spawn(async move { pipeline.run(shutdown_rx).await });

    let offsets = h.offsets.clone();
    wait_until("first checkpoint", || offsets.committed(&bookings(0)) == Some(0)).await;
    assert!(h.dead_letters.letters().is_empty());

    h.clock.advance(chrono::Duration::seconds(6));
    wait_until("checkpoint past parked event", || offsets.committed(&bookings(0)) == Some(1)).await;

    shutdown_tx.send(true).unwrap();
    let outcome = running.await.unwrap();
    assert!(outcome.is_clean());

    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, FailureKind::ReorderTimeout);
    assert_eq!(letters[0].offset, 1);
    assert_eq!(h.views.row("A1").unwrap().last_applied_sequence, 0);
}

/// Fails every upsert of aggregates whose id starts with `BAD`.
#[derive(Clone)]
struct FailingForBad {
    inner: InMemoryViewStore,
}

impl ViewStore for FailingForBad {
    fn upsert(
        &self,
        row: ProjectionRow,
    ) -> Pin<Box<dyn Future<Output = StoreResult<UpsertOutcome>> + Send + '_>> {
        if row.aggregate_id.starts_with("BAD") {
            return Box::pin(async { Err(StoreError::Backend("disk full".to_string())) });
        }
        self.inner.upsert(row)
    }

    fn get(
        &self,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<ProjectionRow>>> + Send + '_>> {
        self.inner.get(aggregate_id)
    }

    fn query(&self, filter: ViewFilter) -> BoxStream<'_, StoreResult<ProjectionRow>> {
        self.inner.query(filter)
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
        self.inner.clear()
    }
}

#[tokio::test]
async fn storage_failure_halts_only_its_partition() {
    let h = Harness::new();
    let (sick, healthy) = (bookings(0), bookings(1));
    h.log.push_event(&sick, &fixtures::booking_created("OK-1", "RN", "Leeds", &[]));
    h.log.push_event(&sick, &fixtures::booking_created("BAD-1", "RN", "Leeds", &[]));
    h.log.push_event(&sick, &fixtures::booking_created("OK-2", "RN", "Leeds", &[]));
    for i in 0..6 {
        h.log.push_event(&healthy, &fixtures::booking_created(&format!("G-{i}"), "HCA", "York", &[]));
    }

    let views = FailingForBad { inner: h.views.clone() };
    let pipeline = h.pipeline_on(Arc::new(views), vec![sick.clone(), healthy.clone()]);
    let offsets = h.offsets.clone();
    let outcome = run_until(pipeline, "both partitions settled", || {
        offsets.committed(&bookings(1)) == Some(5) && offsets.committed(&bookings(0)) == Some(0)
    })
    .await;

    assert_eq!(outcome.halted.len(), 1);
    let WorkerError::Storage { partition, offset, .. } = &outcome.halted[0] else {
        unreachable!("expected a storage halt, got {:?}", outcome.halted[0]);
    };
    assert_eq!(partition, &sick);
    assert_eq!(*offset, 1);

    assert_eq!(outcome.stopped.len(), 1);
    assert_eq!(outcome.stopped[0].partition, healthy);

    assert_eq!(h.offsets.committed(&sick), Some(0));
    assert!(h.views.row("OK-1").is_some());
    assert!(h.views.row("OK-2").is_none());
    assert_eq!(h.views.len(), 7);
}

/// Holds upserts of aggregates whose id starts with `HOLD` until the gate opens.
#[derive(Clone)]
struct HoldingViews {
    inner: InMemoryViewStore,
    gate: Arc<Semaphore>,
}

impl ViewStore for HoldingViews {
    fn upsert(
        &self,
        row: ProjectionRow,
    ) -> Pin<Box<dyn Future<Output = StoreResult<UpsertOutcome>> + Send + '_>> {
        Box::pin(async move {
            if row.aggregate_id.starts_with("HOLD") {
                let _permit = self.gate.acquire().await;
            }
            self.inner.upsert(row).await
        })
    }

    fn get(
        &self,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<ProjectionRow>>> + Send + '_>> {
        self.inner.get(aggregate_id)
    }

    fn query(&self, filter: ViewFilter) -> BoxStream<'_, StoreResult<ProjectionRow>> {
        self.inner.query(filter)
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
        self.inner.clear()
    }
}

#[tokio::test]
async fn lag_is_reported_while_working_through_backlog() {
    let h = Harness::new();
    let p = bookings(0);
    for i in 0..10 {
        h.log.push_event(&p, &fixtures::booking_created(&format!("B-{i}"), "RN", "Leeds", &[]));
    }
    h.log.push_event(&p, &fixtures::booking_created("HOLD-1", "RN", "Leeds", &[]));
    for i in 10..40 {
        h.log.push_event(&p, &fixtures::booking_created(&format!("B-{i}"), "RN", "Leeds", &[]));
    }
    h.clock.advance(chrono::Duration::minutes(5));

    let gate = Arc::new(Semaphore::new(0));
    let views = HoldingViews {
        inner: h.views.clone(),
        gate: Arc::clone(&gate),
    };
    let pipeline = h.pipeline_on(Arc::new(views), vec![p.clone()]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(async move { pipeline.run(shutdown_rx).await });

    // Batches of four: the third batch stalls on HOLD-1 at offset 10.
    let lag = h.lag.clone();
    wait_until("first two batches", || lag.progress(&bookings(0)).applied_offset == Some(7)).await;
    assert_eq!(h.lag.offset_lag(&p), 33);
    assert_eq!(h.lag.lag(&p), Duration::from_secs(300));
    assert!(h.lag.is_caught_up(&p, 7));
    assert!(!h.lag.is_caught_up(&p, 40));

    gate.add_permits(1);
    wait_until("backlog drained", || lag.progress(&bookings(0)).applied_offset == Some(40)).await;
    assert_eq!(h.lag.offset_lag(&p), 0);
    assert_eq!(h.lag.lag(&p), Duration::ZERO);

    shutdown_tx.send(true).expect("pipeline dropped its receiver");
    let outcome = running.await.expect("pipeline task panicked");
    assert!(outcome.is_clean());
    assert_eq!(outcome.stopped[0].applied, 41);
}

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::booking_created("B1", "RN", "Leeds", &[]));
    h.log.push_event(&p, &fixtures::booking_booked("B1", 1, "C1"));

    let offsets = h.offsets.clone();
    run_until(h.pipeline(vec![p.clone()]), "first run", || offsets.committed(&bookings(0)) == Some(1)).await;
    assert_eq!(h.views.upsert_calls(), 2);

    h.log.push_event(&p, &fixtures::booking_pullout("B1", 2, "C1"));
    let offsets = h.offsets.clone();
    run_until(h.pipeline(vec![p.clone()]), "second run", || offsets.committed(&bookings(0)) == Some(2)).await;

    assert_eq!(h.views.upsert_calls(), 3);
    let row = h.views.row("B1").unwrap();
    assert_eq!(row.field_str("status"), Some("OPEN"));
    assert!(row.field_str("carer_id").is_none());
}

#[tokio::test]
async fn rebuild_replays_to_the_same_view() {
    let h = Harness::new();
    let p = bookings(0);
    h.log.push_event(&p, &fixtures::booking_created("B1", "RN", "Leeds", &["BLS"]));
    h.log.push_event(&p, &fixtures::booking_booked("B1", 1, "C1"));
    h.log.push_event(&p, &fixtures::booking_cancelled("B1", 2));
    h.log.push_event(&p, &fixtures::booking_created("B2", "RN", "Leeds", &[]));

    let offsets = h.offsets.clone();
    run_until(h.pipeline(vec![p.clone()]), "first build", || offsets.committed(&bookings(0)) == Some(3)).await;
    let before = h.views.rows();

    let pipeline = h.pipeline(vec![p.clone()]);
    pipeline.rebuild().await.unwrap();
    assert!(h.views.is_empty());
    assert_eq!(h.offsets.committed(&p), None);

    let offsets = h.offsets.clone();
    run_until(pipeline, "rebuild", || offsets.committed(&bookings(0)) == Some(3)).await;
    assert_eq!(h.views.rows(), before);
    assert!(h.views.row("B1").unwrap().tombstoned);
}

#[tokio::test]
async fn shutdown_stops_idle_workers() {
    let h = Harness::new();
    let partitions = staffing_views_projections::all_partitions(2);
    let pipeline = h.pipeline(partitions.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(async move { pipeline.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("workers did not stop")
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(outcome.stopped.len(), partitions.len());
    assert!(outcome.stopped.iter().all(|report| report.committed.is_none()));
}
