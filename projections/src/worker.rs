//! One worker per partition.
//!
//! # Overview
//!
//! A [`PartitionWorker`] drives a [`PartitionConsumer`] and a
//! [`ProjectionApplier`] for a single partition, sequentially:
//!
//! 1. Load the partition's checkpoint and seek past it
//! 2. Poll a batch and apply each event in log order
//! 3. Dead-letter what cannot be applied, escalate parked events that
//!    waited too long
//! 4. Commit the checkpoint, then report progress to the [`LagTracker`]
//! 5. Sleep when idle; stop when the shutdown signal flips
//!
//! # Checkpoints
//!
//! The committed offset is the highest offset such that every record at or
//! below it is either in the view, deduplicated, or dead-lettered. Records
//! parked in the reorder buffer hold the checkpoint back, so a crash replays
//! them instead of losing them. Commits happen only after the upserts they
//! cover returned, never before.
//!
//! # Halting
//!
//! Storage failures that outlive their retries, exhausted fetch retries and
//! checkpoint failures end the worker with a [`WorkerError`]. Only this
//! partition stops; the supervisor keeps the others running.

use crate::applier::{Applied, ApplyError, ProjectionApplier, ReleasedEvent};
use crate::consumer::{ConsumerError, PartitionConsumer, Polled};
use crate::lag::LagTracker;
use crate::reorder::BufferedEvent;
use crate::supervisor::PipelineSettings;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use staffing_views_core::codec;
use staffing_views_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureKind};
use staffing_views_core::environment::Clock;
use staffing_views_core::event::DomainEvent;
use staffing_views_core::event_log::EventLog;
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::{ConsumerOffset, OffsetStore, StoreError, ViewStore};
use staffing_views_runtime::retry::{RetryPolicy, retry_with_backoff};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why a partition worker stopped early.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerError {
    /// The view store kept failing.
    #[error("Partition {partition} halted at offset {offset}: {source}")]
    Storage {
        /// Halted partition
        partition: PartitionId,
        /// Offset of the event that could not be stored
        offset: u64,
        /// The storage failure
        source: ApplyError,
    },

    /// The event log stayed unreachable.
    #[error("Partition {partition} halted: {source}")]
    Connection {
        /// Halted partition
        partition: PartitionId,
        /// The fetch failure
        source: ConsumerError,
    },

    /// The checkpoint could not be loaded or committed.
    #[error("Partition {partition} halted: checkpoint failed: {source}")]
    Checkpoint {
        /// Halted partition
        partition: PartitionId,
        /// The offset store failure
        source: StoreError,
    },

    /// The dead-letter sink refused a record.
    #[error("Partition {partition} halted: dead-letter sink failed: {source}")]
    DeadLetter {
        /// Halted partition
        partition: PartitionId,
        /// The sink failure
        source: DeadLetterError,
    },

    /// The worker task ended abnormally.
    #[error("Partition worker crashed: {0}")]
    Crashed(String),
}

impl WorkerError {
    /// Partition that halted, when known.
    #[must_use]
    pub const fn partition(&self) -> Option<&PartitionId> {
        match self {
            Self::Storage { partition, .. }
            | Self::Connection { partition, .. }
            | Self::Checkpoint { partition, .. }
            | Self::DeadLetter { partition, .. } => Some(partition),
            Self::Crashed(_) => None,
        }
    }
}

/// Counters of a worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Partition the worker ran on
    pub partition: PartitionId,
    /// Last committed offset
    pub committed: Option<u64>,
    /// Events that created or changed a row
    pub applied: u64,
    /// Redelivered events that were skipped
    pub duplicates: u64,
    /// Records sent to the dead-letter sink
    pub dead_lettered: u64,
}

/// Shared collaborators of all partition workers.
#[derive(Clone)]
pub struct PipelineHandles {
    /// Where events are read from
    pub log: Arc<dyn EventLog>,
    /// Where projection rows are written
    pub views: Arc<dyn ViewStore>,
    /// Where checkpoints are kept
    pub offsets: Arc<dyn OffsetStore>,
    /// Where unprocessable records go
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Progress per partition
    pub lag: LagTracker,
}

/// Sequential consumer-applier loop for one partition.
pub struct PartitionWorker {
    partition: PartitionId,
    consumer: PartitionConsumer,
    applier: ProjectionApplier,
    handles: PipelineHandles,
    checkpoint_retry: RetryPolicy,
    idle_poll_interval: Duration,
    reorder_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    processed_through: Option<u64>,
    committed: Option<u64>,
    occurred: BTreeMap<u64, DateTime<Utc>>,
    report: WorkerReport,
}

impl PartitionWorker {
    /// Create a worker for `partition`.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        handles: PipelineHandles,
        settings: &PipelineSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let consumer = PartitionConsumer::new(
            Arc::clone(&handles.log),
            Arc::clone(&handles.dead_letters),
            partition.clone(),
            settings.consumer_settings(),
        );
        let applier = ProjectionApplier::new(Arc::clone(&handles.views), settings.applier_settings());

        Self {
            report: WorkerReport {
                partition: partition.clone(),
                committed: None,
                applied: 0,
                duplicates: 0,
                dead_lettered: 0,
            },
            partition,
            consumer,
            applier,
            handles,
            checkpoint_retry: settings.storage_retry.clone(),
            idle_poll_interval: settings.idle_poll_interval,
            reorder_timeout: settings.reorder_timeout,
            shutdown,
            processed_through: None,
            committed: None,
            occurred: BTreeMap::new(),
        }
    }

    /// Use `clock` for reorder timeouts and row timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.applier = self.applier.with_clock(clock);
        self
    }

    /// Run until shutdown or until the partition halts.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the partition halts. Everything applied
    /// before the failure is already checkpointed.
    pub async fn run(mut self) -> Result<WorkerReport, WorkerError> {
        tracing::info!(partition = %self.partition, "Starting partition worker");
        self.resume().await?;

        loop {
            if *self.shutdown.borrow() {
                tracing::info!(partition = %self.partition, "Shutdown signal received");
                break;
            }

            let polled = self.step().await;
            // Every pass, busy or idle.
            self.observe_watermark().await;
            self.escalate_expired().await?;
            self.checkpoint().await?;
            let polled = polled?;

            if polled == 0 {
                tokio::select! {
                    () = tokio::time::sleep(self.idle_poll_interval) => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            tracing::info!(partition = %self.partition, "Shutdown channel closed");
                            break;
                        }
                    }
                }
            }
        }

        self.checkpoint().await?;
        tracing::info!(
            partition = %self.partition,
            committed = ?self.committed,
            applied = self.report.applied,
            dead_lettered = self.report.dead_lettered,
            "Partition worker stopped"
        );
        Ok(self.report)
    }

    async fn resume(&mut self) -> Result<(), WorkerError> {
        let offsets = Arc::clone(&self.handles.offsets);
        let stored = retry_with_backoff(&self.checkpoint_retry, "offset_store.load", || {
            offsets.load(&self.partition)
        })
        .await
        .map_err(|err| WorkerError::Checkpoint {
            partition: self.partition.clone(),
            source: err.last_error,
        })?;

        if let Some(offset) = stored {
            tracing::info!(
                partition = %self.partition,
                committed = offset.committed_sequence,
                "Resuming from checkpoint"
            );
            self.committed = Some(offset.committed_sequence);
            self.processed_through = Some(offset.committed_sequence);
            self.report.committed = self.committed;
            self.consumer.seek(offset.next_offset());
        } else {
            tracing::info!(partition = %self.partition, "Starting from beginning");
            self.consumer.seek(0);
        }
        Ok(())
    }

    // One poll; returns how many records it covered.
    async fn step(&mut self) -> Result<usize, WorkerError> {
        let items: Vec<_> = self.consumer.poll().collect().await;
        let mut covered = 0;

        for item in items {
            match item {
                Ok(Polled::Event { offset, event }) => self.handle_event(offset, event).await?,
                Ok(Polled::DeadLettered { offset, .. }) => {
                    self.report.dead_lettered += 1;
                    self.processed_through = Some(offset);
                }
                Err(ConsumerError::DeadLetter(source)) => {
                    return Err(WorkerError::DeadLetter {
                        partition: self.partition.clone(),
                        source,
                    });
                }
                Err(source) => {
                    return Err(WorkerError::Connection {
                        partition: self.partition.clone(),
                        source,
                    });
                }
            }
            covered += 1;
        }
        Ok(covered)
    }

    async fn handle_event(&mut self, offset: u64, event: DomainEvent) -> Result<(), WorkerError> {
        match self.applier.apply_record(&event, offset).await {
            Ok(report) => {
                self.count(report.applied);
                self.occurred.insert(offset, event.occurred_at);
                for released in report.released {
                    self.handle_released(released, offset).await?;
                }
            }
            Err(ApplyError::OutOfOrder { expected, .. }) => {
                metrics::counter!("view.events.out_of_order", "partition" => self.partition.to_string())
                    .increment(1);
                tracing::debug!(
                    partition = %self.partition,
                    offset,
                    aggregate_id = %event.aggregate_id,
                    sequence = event.sequence_number,
                    expected,
                    "Event ahead of its predecessor, parked"
                );
            }
            Err(err @ ApplyError::BufferFull { .. }) => {
                self.dead_letter(&event, offset, FailureKind::ReorderOverflow, err.to_string())
                    .await?;
            }
            Err(ApplyError::InvalidPayload(err)) => {
                self.dead_letter(&event, offset, FailureKind::InvalidPayload, err.to_string())
                    .await?;
            }
            Err(source @ ApplyError::StorageFailure { .. }) => return Err(self.halt(offset, source)),
        }
        self.processed_through = Some(offset);
        Ok(())
    }

    async fn handle_released(&mut self, released: ReleasedEvent, current: u64) -> Result<(), WorkerError> {
        let offset = released.offset.unwrap_or(current);
        match released.result {
            Ok(applied) => {
                self.count(applied);
                self.occurred.insert(offset, released.event.occurred_at);
                Ok(())
            }
            Err(ApplyError::InvalidPayload(err)) => {
                self.dead_letter(&released.event, offset, FailureKind::InvalidPayload, err.to_string())
                    .await
            }
            Err(source @ ApplyError::StorageFailure { .. }) => Err(self.halt(offset, source)),
            Err(other) => {
                tracing::warn!(
                    partition = %self.partition,
                    offset,
                    error = %other,
                    "Unexpected result for released event"
                );
                Ok(())
            }
        }
    }

    async fn escalate_expired(&mut self) -> Result<(), WorkerError> {
        for BufferedEvent { event, offset, .. } in self.applier.expire_stale() {
            let reason = format!(
                "sequence {} of {} waited more than {:?} for its predecessor",
                event.sequence_number, event.aggregate_id, self.reorder_timeout
            );
            let offset = offset.unwrap_or_default();
            self.dead_letter(&event, offset, FailureKind::ReorderTimeout, reason)
                .await?;
        }
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        event: &DomainEvent,
        offset: u64,
        kind: FailureKind,
        reason: String,
    ) -> Result<(), WorkerError> {
        tracing::warn!(
            partition = %self.partition,
            offset,
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence_number,
            kind = kind.as_str(),
            reason = %reason,
            "Sending event to dead-letter queue"
        );

        // Decoded events always re-encode; an empty payload still records the failure.
        let payload = codec::encode(event).unwrap_or_default();
        let letter = DeadLetter::new(self.partition.clone(), offset, payload, kind, reason)
            .with_aggregate_id(event.aggregate_id.clone());

        self.handles
            .dead_letters
            .send(letter)
            .await
            .map_err(|source| WorkerError::DeadLetter {
                partition: self.partition.clone(),
                source,
            })?;

        metrics::counter!("view.dead_letter.added", "partition" => self.partition.to_string(), "kind" => kind.as_str())
            .increment(1);
        self.report.dead_lettered += 1;
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<(), WorkerError> {
        let Some(through) = self.processed_through else {
            return Ok(());
        };
        let target = match self.applier.lowest_buffered_offset() {
            Some(0) => return Ok(()),
            Some(lowest) => through.min(lowest - 1),
            None => through,
        };
        if self.committed.is_some_and(|committed| committed >= target) {
            return Ok(());
        }

        let offsets = Arc::clone(&self.handles.offsets);
        let checkpoint = ConsumerOffset::new(self.partition.clone(), target);
        retry_with_backoff(&self.checkpoint_retry, "offset_store.commit", || {
            offsets.commit(checkpoint.clone())
        })
        .await
        .map_err(|err| WorkerError::Checkpoint {
            partition: self.partition.clone(),
            source: err.last_error,
        })?;

        let occurred_at = self
            .occurred
            .range(..=target)
            .next_back()
            .map_or_else(Utc::now, |(_, at)| *at);
        self.occurred = match target.checked_add(1) {
            Some(next) => self.occurred.split_off(&next),
            None => BTreeMap::new(),
        };
        self.committed = Some(target);
        self.report.committed = Some(target);
        self.handles
            .lag
            .record_applied(&self.partition, target, occurred_at);

        tracing::debug!(partition = %self.partition, offset = target, "Checkpoint saved");
        Ok(())
    }

    async fn observe_watermark(&self) {
        match self.handles.log.high_watermark(&self.partition).await {
            Ok(high_watermark) => self.handles.lag.record_observed(&self.partition, high_watermark),
            Err(err) => {
                tracing::debug!(partition = %self.partition, error = %err, "Could not read high watermark");
            }
        }
    }

    fn count(&mut self, applied: Applied) {
        let partition = self.partition.to_string();
        match applied {
            Applied::Created | Applied::Folded => {
                self.report.applied += 1;
                metrics::counter!("view.events.applied", "partition" => partition).increment(1);
            }
            Applied::Duplicate => {
                self.report.duplicates += 1;
                metrics::counter!("view.events.duplicate", "partition" => partition).increment(1);
            }
        }
    }

    fn halt(&self, offset: u64, source: ApplyError) -> WorkerError {
        tracing::error!(
            partition = %self.partition,
            offset,
            committed = ?self.committed,
            error = %source,
            "Storage failure, halting partition"
        );
        WorkerError::Storage {
            partition: self.partition.clone(),
            offset,
            source,
        }
    }
}
