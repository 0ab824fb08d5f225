//! Dead letters: records the pipeline gave up on.
//!
//! A record is dead-lettered when it cannot ever be applied as-is: its
//! envelope does not decode, its payload does not fit its event type, or it
//! waited in the reorder buffer for a predecessor that never came. The
//! partition moves on; the dead letter keeps everything needed to inspect
//! and replay it by hand.

use crate::partition::PartitionId;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors writing to a dead-letter sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// Sink backend failed
    #[error("Dead-letter storage error: {0}")]
    Storage(String),

    /// No entry with that id
    #[error("Dead letter {0} not found")]
    NotFound(i64),
}

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The envelope failed to decode
    Decode,
    /// The payload does not have the shape its event type requires
    InvalidPayload,
    /// The event waited for a missing predecessor past the reorder timeout
    ReorderTimeout,
    /// The reorder buffer was full
    ReorderOverflow,
}

impl FailureKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::InvalidPayload => "invalid_payload",
            Self::ReorderTimeout => "reorder_timeout",
            Self::ReorderOverflow => "reorder_overflow",
        }
    }

    /// Parse from [`as_str`](Self::as_str) form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decode" => Some(Self::Decode),
            "invalid_payload" => Some(Self::InvalidPayload),
            "reorder_timeout" => Some(Self::ReorderTimeout),
            "reorder_overflow" => Some(Self::ReorderOverflow),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage state of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterStatus {
    /// Waiting for someone to look at it
    Pending,
    /// Replayed or otherwise fixed
    Resolved,
    /// Deliberately dropped
    Discarded,
}

impl DeadLetterStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse from [`as_str`](Self::as_str) form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// A record the pipeline skipped, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Partition the record came from
    pub partition: PartitionId,

    /// Log offset of the record
    pub offset: u64,

    /// Aggregate id, when the envelope decoded far enough to know it
    pub aggregate_id: Option<String>,

    /// The raw envelope bytes, as read from the log
    pub payload: Vec<u8>,

    /// Failure category
    pub kind: FailureKind,

    /// Human readable failure description
    pub reason: String,

    /// How many attempts were made before giving up
    pub retry_count: u32,

    /// When the record was given up on
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a dead letter stamped with the current time.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        offset: u64,
        payload: Vec<u8>,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            offset,
            aggregate_id: None,
            payload,
            kind,
            reason: reason.into(),
            retry_count: 0,
            failed_at: Utc::now(),
        }
    }

    /// Attach the aggregate id.
    #[must_use]
    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Record the number of attempts made.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter, returning its id in the sink.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the sink cannot persist it.
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + '_>>;
}
