//! Query side of the view: what the read API serves.
//!
//! Tombstoned rows are kept in storage so redelivered events stay
//! idempotent, but they are never returned from here.

use futures::TryStreamExt;
use staffing_views_core::event::AggregateType;
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::{ProjectionRow, StoreError, ViewFilter, ViewStore};
use staffing_views_projections::LagTracker;
use std::sync::Arc;
use std::time::Duration;

/// Read access to the materialized view plus its freshness.
#[derive(Clone)]
pub struct ReadModel {
    views: Arc<dyn ViewStore>,
    lag: LagTracker,
    partitions_per_topic: u32,
}

impl ReadModel {
    /// Create a read model over `views`, reporting freshness from `lag`.
    #[must_use]
    pub fn new(views: Arc<dyn ViewStore>, lag: LagTracker, partitions_per_topic: u32) -> Self {
        Self {
            views,
            lag,
            partitions_per_topic,
        }
    }

    /// The live row of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the view store fails.
    pub async fn get(&self, aggregate_id: &str) -> Result<Option<ProjectionRow>, StoreError> {
        let row = self.views.get(aggregate_id).await?;
        Ok(row.filter(|row| !row.tombstoned))
    }

    /// Live rows matching `filter`, ordered by aggregate id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the view store fails.
    pub async fn query(&self, mut filter: ViewFilter) -> Result<Vec<ProjectionRow>, StoreError> {
        filter.include_tombstoned = false;
        self.views.query(filter).try_collect().await
    }

    /// Partition that carries the events of an aggregate.
    #[must_use]
    pub fn partition_of(&self, aggregate_type: AggregateType, aggregate_id: &str) -> PartitionId {
        PartitionId::for_aggregate(aggregate_type, aggregate_id, self.partitions_per_topic)
    }

    /// Whether the view already reflects `offset` of `partition`.
    ///
    /// A writer that knows the offset its event was appended at can use this
    /// to decide whether a read will see its own write.
    #[must_use]
    pub fn is_caught_up(&self, partition: &PartitionId, offset: u64) -> bool {
        self.lag.is_caught_up(partition, offset)
    }

    /// How far behind the log `partition` is, in event time.
    #[must_use]
    pub fn lag(&self, partition: &PartitionId) -> Duration {
        self.lag.lag(partition)
    }

    /// Records between the view and the head of `partition`.
    #[must_use]
    pub fn offset_lag(&self, partition: &PartitionId) -> u64 {
        self.lag.offset_lag(partition)
    }
}
