//! In-memory partitioned event log.

use chrono::Utc;
use staffing_views_core::codec;
use staffing_views_core::event::DomainEvent;
use staffing_views_core::event_log::{ConnectionError, EventLog, LogRecord};
use staffing_views_core::partition::PartitionId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Vector-per-partition [`EventLog`].
///
/// Partitions are created on first append. Fetching from a partition that
/// was never appended to returns an empty batch, like a fresh broker
/// partition would. `fail_next_fetches(n)` injects transient
/// [`ConnectionError`]s.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventLog {
    partitions: Arc<RwLock<HashMap<PartitionId, Vec<LogRecord>>>>,
    failing_fetches: Arc<AtomicUsize>,
    fetch_calls: Arc<AtomicUsize>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` fetches fail with a connection error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Number of fetch calls so far, failed ones included.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Append raw bytes under `key`, returning the offset.
    pub fn push_raw(&self, partition: &PartitionId, key: &str, payload: Vec<u8>) -> u64 {
        let mut partitions = self.partitions.write().unwrap();
        let records = partitions.entry(partition.clone()).or_default();
        let offset = records.len() as u64;
        records.push(LogRecord {
            offset,
            key: Some(key.to_string()),
            payload,
            timestamp: Some(Utc::now()),
        });
        offset
    }

    /// Encode and append an event to `partition`, returning the offset.
    pub fn push_event(&self, partition: &PartitionId, event: &DomainEvent) -> u64 {
        let payload = codec::encode(event).unwrap();
        self.push_raw(partition, &event.aggregate_id, payload)
    }

    /// Number of records in a partition.
    #[must_use]
    pub fn len(&self, partition: &PartitionId) -> usize {
        self.partitions
            .read()
            .unwrap()
            .get(partition)
            .map_or(0, Vec::len)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventLog for InMemoryEventLog {
    fn fetch(
        &self,
        partition: &PartitionId,
        from_offset: u64,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogRecord>, ConnectionError>> + Send + '_>> {
        let partition = partition.clone();
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.take_injected_failure() {
                return Err(ConnectionError::ConnectionFailed(
                    "injected fetch failure".to_string(),
                ));
            }

            let partitions = self.partitions.read().unwrap();
            let batch = partitions
                .get(&partition)
                .map(|records| {
                    records
                        .iter()
                        .skip(usize::try_from(from_offset).unwrap_or(usize::MAX))
                        .take(max_records)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(batch)
        })
    }

    fn append(
        &self,
        partition: &PartitionId,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>> {
        let offset = self.push_raw(partition, key, payload);
        Box::pin(async move { Ok(offset) })
    }

    fn high_watermark(
        &self,
        partition: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>> {
        let len = self.len(partition) as u64;
        Box::pin(async move { Ok(len) })
    }
}
