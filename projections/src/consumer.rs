//! Ordered, pull-based consumer of one log partition.
//!
//! # Overview
//!
//! A [`PartitionConsumer`] owns a read position in one partition and turns
//! raw [`LogRecord`]s into decoded [`DomainEvent`]s:
//!
//! ```text
//! ┌─────────────┐   fetch(batch)   ┌───────────────────┐   Polled   ┌────────┐
//! │  EventLog   │ ───────────────▶ │ PartitionConsumer │ ─────────▶ │ worker │
//! └─────────────┘                  └─────────┬─────────┘            └────────┘
//!                                            │ undecodable
//!                                            ▼
//!                                     DeadLetterSink
//! ```
//!
//! Each call to [`poll`](PartitionConsumer::poll) yields at most one batch,
//! in log order, so the stream is finite. Per-aggregate ordering comes from
//! partition affinity upstream: the consumer relies on it and does not
//! re-sort anything.
//!
//! # Failure Handling
//!
//! - Transient [`ConnectionError`]s on fetch are retried with exponential
//!   backoff; once the retries are used up the stream yields
//!   [`ConsumerError::Connection`] and ends.
//! - A record that does not decode is re-read up to `poison_retries` times.
//!   If it still fails it is sent to the dead-letter sink and skipped, and
//!   the stream continues with the next record.

use futures::stream::BoxStream;
use staffing_views_core::codec::{self, DecodeError};
use staffing_views_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureKind};
use staffing_views_core::event::DomainEvent;
use staffing_views_core::event_log::{ConnectionError, EventLog, LogRecord};
use staffing_views_core::partition::PartitionId;
use staffing_views_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;

/// Errors that end a poll.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    /// The log stayed unreachable after retries.
    #[error("Fetch from {partition} failed after {attempts} attempt(s): {source}")]
    Connection {
        /// Partition being read
        partition: PartitionId,
        /// Attempts made
        attempts: usize,
        /// Last connection error
        source: ConnectionError,
    },

    /// A poison record could not be dead-lettered.
    #[error("Dead-letter sink rejected record: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

/// One item of a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    /// A decoded event
    Event {
        /// Log offset of the record
        offset: u64,
        /// The decoded event
        event: DomainEvent,
    },
    /// An undecodable record that was dead-lettered and skipped
    DeadLettered {
        /// Log offset of the record
        offset: u64,
        /// Why it was rejected
        error: DecodeError,
    },
}

impl Polled {
    /// Log offset of the record this item came from.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Event { offset, .. } | Self::DeadLettered { offset, .. } => *offset,
        }
    }
}

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Maximum records per poll
    pub batch_size: usize,
    /// Re-reads of an undecodable record before it is dead-lettered
    pub poison_retries: u32,
    /// Retry policy for fetches
    pub fetch_retry: RetryPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poison_retries: 3,
            fetch_retry: RetryPolicy::builder().max_retries(5).jitter(true).build(),
        }
    }
}

/// Pull-based reader of one partition.
pub struct PartitionConsumer {
    log: Arc<dyn EventLog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    partition: PartitionId,
    position: u64,
    settings: ConsumerSettings,
}

impl PartitionConsumer {
    /// Create a consumer positioned at offset 0.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        partition: PartitionId,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            log,
            dead_letters,
            partition,
            position: 0,
            settings,
        }
    }

    /// Partition this consumer reads.
    #[must_use]
    pub const fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Offset the next poll starts at.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position, e.g. to resume after a checkpoint.
    pub const fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    /// Read the next batch.
    ///
    /// The position advances as items are pulled from the stream, so
    /// dropping the stream early leaves unread records for the next poll.
    pub fn poll(&mut self) -> BoxStream<'_, Result<Polled, ConsumerError>> {
        Box::pin(async_stream::stream! {
            let batch = match self.fetch(self.position, self.settings.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            for record in batch {
                let offset = record.offset;
                let item = match codec::decode(&record.payload) {
                    Ok(event) => Ok(Polled::Event { offset, event }),
                    Err(err) => self.recover_poison(record, err).await,
                };
                match item {
                    Ok(polled) => {
                        self.position = offset.saturating_add(1);
                        yield Ok(polled);
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        })
    }

    async fn fetch(&self, from_offset: u64, max_records: usize) -> Result<Vec<LogRecord>, ConsumerError> {
        retry_with_predicate(
            &self.settings.fetch_retry,
            "event_log.fetch",
            || self.log.fetch(&self.partition, from_offset, max_records),
            ConnectionError::is_transient,
        )
        .await
        .map_err(|err| ConsumerError::Connection {
            partition: self.partition.clone(),
            attempts: err.attempts,
            source: err.last_error,
        })
    }

    // Re-reads an undecodable record; dead-letters it once the retries run out.
    async fn recover_poison(&self, record: LogRecord, first_error: DecodeError) -> Result<Polled, ConsumerError> {
        let offset = record.offset;
        let mut last_error = first_error;
        let mut attempts: u32 = 1;

        for retry in 0..self.settings.poison_retries {
            let delay = self.settings.fetch_retry.backoff(usize::try_from(retry).unwrap_or(usize::MAX));
            tokio::time::sleep(delay).await;
            attempts += 1;

            let refetched = self.fetch(offset, 1).await?;
            let Some(again) = refetched.into_iter().find(|r| r.offset == offset) else {
                break;
            };
            match codec::decode(&again.payload) {
                Ok(event) => {
                    tracing::info!(
                        partition = %self.partition,
                        offset,
                        attempts,
                        "Record decoded after re-read"
                    );
                    return Ok(Polled::Event { offset, event });
                }
                Err(err) => last_error = err,
            }
        }

        tracing::warn!(
            partition = %self.partition,
            offset,
            attempts,
            error = %last_error,
            "Undecodable record, sending to dead-letter queue"
        );

        let mut letter = DeadLetter::new(
            self.partition.clone(),
            offset,
            record.payload,
            FailureKind::Decode,
            last_error.to_string(),
        )
        .with_retry_count(attempts);
        if let Some(key) = record.key {
            letter = letter.with_aggregate_id(key);
        }

        self.dead_letters.send(letter).await?;
        metrics::counter!("view.dead_letter.added", "partition" => self.partition.to_string(), "kind" => FailureKind::Decode.as_str())
            .increment(1);

        Ok(Polled::DeadLettered {
            offset,
            error: last_error,
        })
    }
}
