//! In-memory view and offset stores.

use futures::stream::{self, BoxStream, StreamExt};
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::{
    ConsumerOffset, OffsetStore, ProjectionRow, Result, StoreError, UpsertOutcome, ViewFilter,
    ViewStore,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// `BTreeMap`-backed [`ViewStore`], ordered by aggregate id.
///
/// `fail_next_upserts(n)` makes the next `n` upserts fail with
/// [`StoreError::Backend`], which is how tests exercise storage retries.
#[derive(Clone, Debug, Default)]
pub struct InMemoryViewStore {
    rows: Arc<RwLock<BTreeMap<String, ProjectionRow>>>,
    failing_upserts: Arc<AtomicUsize>,
    upsert_calls: Arc<AtomicUsize>,
}

impl InMemoryViewStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail.
    pub fn fail_next_upserts(&self, count: usize) {
        self.failing_upserts.store(count, Ordering::SeqCst);
    }

    /// Number of upsert calls so far, failed ones included.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a row.
    #[must_use]
    pub fn row(&self, aggregate_id: &str) -> Option<ProjectionRow> {
        self.rows.read().unwrap().get(aggregate_id).cloned()
    }

    /// Snapshot of every row.
    #[must_use]
    pub fn rows(&self) -> Vec<ProjectionRow> {
        self.rows.read().unwrap().values().cloned().collect()
    }

    /// Number of rows, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Whether the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ViewStore for InMemoryViewStore {
    fn upsert(
        &self,
        row: ProjectionRow,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>> {
        Box::pin(async move {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.take_injected_failure() {
                return Err(StoreError::Backend("injected upsert failure".to_string()));
            }

            let mut rows = self.rows.write().unwrap();
            match rows.get(&row.aggregate_id) {
                Some(stored) if stored.last_applied_sequence >= row.last_applied_sequence => {
                    Ok(UpsertOutcome::Stale)
                }
                _ => {
                    rows.insert(row.aggregate_id.clone(), row);
                    Ok(UpsertOutcome::Written)
                }
            }
        })
    }

    fn get(
        &self,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionRow>>> + Send + '_>> {
        let row = self.row(aggregate_id);
        Box::pin(async move { Ok(row) })
    }

    fn query(&self, filter: ViewFilter) -> BoxStream<'_, Result<ProjectionRow>> {
        let selected: Vec<_> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|row| filter.matches(row))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(selected).boxed()
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.rows.write().unwrap().clear();
            Ok(())
        })
    }
}

/// `HashMap`-backed [`OffsetStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: Arc<RwLock<HashMap<PartitionId, u64>>>,
    commits: Arc<AtomicUsize>,
}

impl InMemoryOffsetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed offset of a partition, if any.
    #[must_use]
    pub fn committed(&self, partition_id: &PartitionId) -> Option<u64> {
        self.offsets.read().unwrap().get(partition_id).copied()
    }

    /// Number of commit calls so far.
    #[must_use]
    pub fn commit_calls(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl OffsetStore for InMemoryOffsetStore {
    fn load(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ConsumerOffset>>> + Send + '_>> {
        let offset = self
            .committed(partition_id)
            .map(|committed| ConsumerOffset::new(partition_id.clone(), committed));
        Box::pin(async move { Ok(offset) })
    }

    fn commit(
        &self,
        offset: ConsumerOffset,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.commits.fetch_add(1, Ordering::SeqCst);
            let mut offsets = self.offsets.write().unwrap();
            let stored = offsets.entry(offset.partition_id).or_insert(offset.committed_sequence);
            *stored = (*stored).max(offset.committed_sequence);
            Ok(())
        })
    }

    fn reset(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let partition_id = partition_id.clone();
        Box::pin(async move {
            self.offsets.write().unwrap().remove(&partition_id);
            Ok(())
        })
    }
}
