//! Runs one worker per partition and rebuilds the view on demand.
//!
//! # Example
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let pipeline = ViewMaintenance::new(handles, all_partitions(8), PipelineSettings::default());
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown_tx.send(true).ok();
//! });
//!
//! let outcome = pipeline.run(shutdown_rx).await;
//! ```

use crate::applier::ApplierSettings;
use crate::consumer::ConsumerSettings;
use crate::lag::LagTracker;
use crate::worker::{PartitionWorker, PipelineHandles, WorkerError, WorkerReport};
use staffing_views_core::environment::{Clock, SystemClock};
use staffing_views_core::event::AggregateType;
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::StoreError;
use staffing_views_runtime::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Tuning shared by every partition worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Maximum records per poll
    pub batch_size: usize,
    /// Sleep between polls that returned nothing
    pub idle_poll_interval: Duration,
    /// Maximum parked events per partition
    pub reorder_capacity: usize,
    /// How long an event may stay parked before it is dead-lettered
    pub reorder_timeout: Duration,
    /// Re-reads of an undecodable record before it is dead-lettered
    pub poison_retries: u32,
    /// Retry policy for log fetches
    pub fetch_retry: RetryPolicy,
    /// Retry policy for view-store and offset-store calls
    pub storage_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let consumer = ConsumerSettings::default();
        let applier = ApplierSettings::default();
        Self {
            batch_size: consumer.batch_size,
            idle_poll_interval: Duration::from_millis(500),
            reorder_capacity: applier.reorder_capacity,
            reorder_timeout: applier.reorder_timeout,
            poison_retries: consumer.poison_retries,
            fetch_retry: consumer.fetch_retry,
            storage_retry: applier.storage_retry,
        }
    }
}

impl PipelineSettings {
    /// Consumer part of the settings.
    #[must_use]
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.batch_size,
            poison_retries: self.poison_retries,
            fetch_retry: self.fetch_retry.clone(),
        }
    }

    /// Applier part of the settings.
    #[must_use]
    pub fn applier_settings(&self) -> ApplierSettings {
        ApplierSettings {
            reorder_capacity: self.reorder_capacity,
            reorder_timeout: self.reorder_timeout,
            storage_retry: self.storage_retry.clone(),
        }
    }
}

/// Every partition of both aggregate topics.
#[must_use]
pub fn all_partitions(partitions_per_topic: u32) -> Vec<PartitionId> {
    [AggregateType::Booking, AggregateType::Carer]
        .into_iter()
        .flat_map(|aggregate| {
            (0..partitions_per_topic.max(1)).map(move |p| PartitionId::new(aggregate.topic(), p))
        })
        .collect()
}

/// How each partition ended.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Partitions that stopped on shutdown
    pub stopped: Vec<WorkerReport>,
    /// Partitions that halted
    pub halted: Vec<WorkerError>,
}

impl RunOutcome {
    /// Whether every partition stopped cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.halted.is_empty()
    }
}

/// The view-maintenance pipeline: one [`PartitionWorker`] per partition.
pub struct ViewMaintenance {
    handles: PipelineHandles,
    partitions: Vec<PartitionId>,
    settings: PipelineSettings,
    clock: Arc<dyn Clock>,
}

impl ViewMaintenance {
    /// Create a pipeline over `partitions`.
    #[must_use]
    pub fn new(handles: PipelineHandles, partitions: Vec<PartitionId>, settings: PipelineSettings) -> Self {
        Self {
            handles,
            partitions,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` in every worker.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Partitions this pipeline owns.
    #[must_use]
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Progress of every partition.
    #[must_use]
    pub const fn lag(&self) -> &LagTracker {
        &self.handles.lag
    }

    /// Run every partition until `shutdown` flips to `true`.
    ///
    /// A halted partition is logged and counted; the others keep running.
    /// Returns once every worker has stopped.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> RunOutcome {
        tracing::info!(partitions = self.partitions.len(), "Starting view maintenance");

        let mut workers = JoinSet::new();
        for partition in &self.partitions {
            let worker = PartitionWorker::new(
                partition.clone(),
                self.handles.clone(),
                &self.settings,
                shutdown.clone(),
            )
            .with_clock(Arc::clone(&self.clock));
            workers.spawn(worker.run());
        }

        let mut outcome = RunOutcome::default();
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(WorkerError::Crashed(err.to_string())));
            match result {
                Ok(report) => outcome.stopped.push(report),
                Err(err) => {
                    let partition = err
                        .partition()
                        .map_or_else(|| "unknown".to_string(), ToString::to_string);
                    metrics::counter!("view.worker.halted", "partition" => partition.clone()).increment(1);
                    tracing::error!(partition = %partition, error = %err, "Partition halted");
                    outcome.halted.push(err);
                }
            }
        }

        tracing::info!(
            stopped = outcome.stopped.len(),
            halted = outcome.halted.len(),
            "View maintenance stopped"
        );
        outcome
    }

    /// Drop the view and every checkpoint so the next run replays the log.
    ///
    /// Must not run concurrently with [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the view or a checkpoint cannot be reset.
    pub async fn rebuild(&self) -> Result<(), StoreError> {
        tracing::info!(partitions = self.partitions.len(), "Rebuilding view");
        self.handles.views.clear().await?;
        for partition in &self.partitions {
            self.handles.offsets.reset(partition).await?;
        }
        tracing::info!("View cleared, restart to replay events");
        Ok(())
    }
}
