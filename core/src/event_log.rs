//! Partitioned event log abstraction.
//!
//! The log is where command services append encoded events and where the
//! view side pulls them from. It is addressed by [`PartitionId`]
//! (`{aggregate-type}-events` topic plus partition number) and every record
//! in a partition has a dense, increasing offset.
//!
//! # Key Principles
//!
//! - **Partition affinity**: all events of one aggregate go to one partition
//!   (see [`crate::partition::partition_for`]), which is what orders them
//! - **At-least-once delivery**: a consumer may see a record more than once
//! - **Pull-based**: consumers ask for a bounded batch starting at an offset,
//!   there are no callbacks
//!
//! # Implementations
//!
//! - `InMemoryEventLog` in the testing crate
//! - `RedpandaEventLog` in the redpanda crate (Kafka-compatible)

use crate::codec::{self, EncodeError};
use crate::event::DomainEvent;
use crate::partition::PartitionId;
use crate::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors talking to the event log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Could not reach the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not answer in time
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The partition does not exist
    #[error("Unknown partition: {0}")]
    UnknownPartition(PartitionId),

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::UnknownPartition(_))
    }
}

/// Errors from [`publish`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The log refused the append
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// One raw record of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the partition
    pub offset: u64,

    /// Record key (the aggregate id for well-behaved producers)
    pub key: Option<String>,

    /// Encoded envelope bytes
    pub payload: Vec<u8>,

    /// Broker append time, when the log keeps one
    pub timestamp: Option<DateTime<Utc>>,
}

/// A partitioned, append-only log of encoded events.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the log can be shared as
/// `Arc<dyn EventLog>` between partition workers.
pub trait EventLog: Send + Sync {
    /// Fetch up to `max_records` records starting at `from_offset`.
    ///
    /// Returns an empty batch when there is nothing at or after
    /// `from_offset` yet.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the broker cannot be reached or the
    /// partition does not exist.
    fn fetch(
        &self,
        partition: &PartitionId,
        from_offset: u64,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogRecord>, ConnectionError>> + Send + '_>>;

    /// Append a record, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the append is not acknowledged.
    fn append(
        &self,
        partition: &PartitionId,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>>;

    /// Offset the next appended record will get.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the broker cannot be reached.
    fn high_watermark(
        &self,
        partition: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>>;
}

/// Encode `event` and append it to the partition owning its aggregate.
///
/// # Errors
///
/// Returns [`PublishError::Encode`] if the event cannot be encoded and
/// [`PublishError::Connection`] if the append fails.
pub async fn publish(
    log: &dyn EventLog,
    event: &DomainEvent,
    partition_count: u32,
) -> Result<(PartitionId, u64), PublishError> {
    let partition = PartitionId::for_aggregate(
        event.event_type.aggregate_type(),
        &event.aggregate_id,
        partition_count,
    );
    let payload = codec::encode(event)?;
    let offset = log.append(&partition, &event.aggregate_id, payload).await?;
    Ok((partition, offset))
}
