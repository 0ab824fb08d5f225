//! Redpanda event log for the staffing view pipeline.
//!
//! Implements [`EventLog`] from `staffing-views-core` on top of rdkafka, so
//! it works against Redpanda or any Kafka-compatible broker.
//!
//! # Topics and partitions
//!
//! Each aggregate type has one topic (`booking-events`, `carer-events`). A
//! [`PartitionId`] maps one to one onto a Kafka topic partition. Producers
//! pick the partition explicitly from the aggregate id, so the broker's own
//! key hashing never decides where an event lands.
//!
//! # Delivery
//!
//! Reading is pull based and offset addressed: [`EventLog::fetch`] assigns
//! the partition at the requested offset and returns whatever arrives within
//! the fetch timeout. No consumer-group offsets are committed here; the view
//! pipeline keeps its checkpoints next to the view rows.
//!
//! ```text
//! command service ──append──► booking-events/0..N ──fetch──► partition worker
//! ```
//!
//! # Example
//!
//! ```no_run
//! use staffing_views_core::event_log::EventLog;
//! use staffing_views_core::partition::PartitionId;
//! use staffing_views_redpanda::RedpandaEventLog;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = RedpandaEventLog::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("view-maintenance")
//!     .build()?;
//!
//! let partition = PartitionId::new("booking-events", 0);
//! for record in log.fetch(&partition, 0, 100).await? {
//!     println!("{} bytes at offset {}", record.payload.len(), record.offset);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use staffing_views_core::event_log::{ConnectionError, EventLog, LogRecord};
use staffing_views_core::partition::PartitionId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn connection_error(partition: &PartitionId, err: &KafkaError) -> ConnectionError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownPartition) => {
            ConnectionError::UnknownPartition(partition.clone())
        },
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            ConnectionError::ConnectionFailed(err.to_string())
        },
        _ => ConnectionError::Transport(format!("{partition}: {err}")),
    }
}

fn kafka_partition(partition: &PartitionId) -> Result<i32, ConnectionError> {
    i32::try_from(partition.partition())
        .map_err(|_| ConnectionError::UnknownPartition(partition.clone()))
}

fn to_record(message: &BorrowedMessage<'_>) -> Option<LogRecord> {
    let offset = u64::try_from(message.offset()).ok()?;
    Some(LogRecord {
        offset,
        key: message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .map(str::to_string),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

/// A consumer pinned to one partition, with the offset it will read next.
struct PartitionReader {
    consumer: StreamConsumer,
    position: Option<u64>,
}

/// Redpanda-backed [`EventLog`].
///
/// Appends go through one shared producer. Each partition gets its own
/// lazily created consumer so partition workers fetch concurrently without
/// disturbing each other's position.
pub struct RedpandaEventLog {
    producer: FutureProducer,
    brokers: String,
    consumer_group: String,
    timeout: Duration,
    fetch_timeout: Duration,
    readers: Mutex<HashMap<PartitionId, Arc<tokio::sync::Mutex<PartitionReader>>>>,
}

impl RedpandaEventLog {
    /// Create an event log with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectionFailed`] if the producer cannot
    /// be created.
    pub fn new(brokers: &str) -> Result<Self, ConnectionError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the event log.
    #[must_use]
    pub fn builder() -> RedpandaEventLogBuilder {
        RedpandaEventLogBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn reader(
        &self,
        partition: &PartitionId,
    ) -> Result<Arc<tokio::sync::Mutex<PartitionReader>>, ConnectionError> {
        let mut readers = self
            .readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(reader) = readers.get(partition) {
            return Ok(Arc::clone(reader));
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        tracing::debug!(partition = %partition, "Created partition consumer");
        let reader = Arc::new(tokio::sync::Mutex::new(PartitionReader {
            consumer,
            position: None,
        }));
        readers.insert(partition.clone(), Arc::clone(&reader));
        Ok(reader)
    }
}

/// Builder for configuring a [`RedpandaEventLog`].
///
/// # Example
///
/// ```no_run
/// use staffing_views_redpanda::RedpandaEventLog;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = RedpandaEventLog::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .fetch_timeout(Duration::from_millis(250))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaEventLogBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    fetch_timeout: Option<Duration>,
}

impl RedpandaEventLogBuilder {
    /// Comma-separated broker addresses (e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id used by the partition consumers.
    ///
    /// Default: "staffing-view-maintenance"
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4" or "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Timeout for appends and watermark lookups.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How long a fetch waits for the first record before returning an
    /// empty batch.
    ///
    /// Default: 500 milliseconds
    #[must_use]
    pub const fn fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = Some(fetch_timeout);
        self
    }

    /// Build the [`RedpandaEventLog`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectionFailed`] if brokers are not set
    /// or the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventLog, ConnectionError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ConnectionError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", (acks == "all").to_string())
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| "staffing-view-maintenance".to_string());

        tracing::info!(
            brokers = %brokers,
            consumer_group = %consumer_group,
            acks,
            compression,
            "RedpandaEventLog created"
        );

        Ok(RedpandaEventLog {
            producer,
            brokers,
            consumer_group,
            timeout,
            fetch_timeout: self.fetch_timeout.unwrap_or(Duration::from_millis(500)),
            readers: Mutex::new(HashMap::new()),
        })
    }
}

impl EventLog for RedpandaEventLog {
    fn fetch(
        &self,
        partition: &PartitionId,
        from_offset: u64,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogRecord>, ConnectionError>> + Send + '_>> {
        let partition = partition.clone();
        Box::pin(async move {
            let kafka_partition = kafka_partition(&partition)?;
            let start = i64::try_from(from_offset)
                .map_err(|_| ConnectionError::Transport(format!("offset {from_offset} out of range")))?;
            let reader = self.reader(&partition)?;
            let mut guard = reader.lock().await;
            let reader = &mut *guard;

            if reader.position != Some(from_offset) {
                let mut assignment = TopicPartitionList::new();
                assignment
                    .add_partition_offset(partition.topic(), kafka_partition, Offset::Offset(start))
                    .map_err(|e| connection_error(&partition, &e))?;
                reader
                    .consumer
                    .assign(&assignment)
                    .map_err(|e| connection_error(&partition, &e))?;
                reader.position = Some(from_offset);
                tracing::debug!(partition = %partition, offset = from_offset, "Assigned partition");
            }

            let mut batch = Vec::with_capacity(max_records.min(1024));
            let mut wait = self.fetch_timeout;
            while batch.len() < max_records {
                let Ok(received) = tokio::time::timeout(wait, reader.consumer.recv()).await else {
                    break;
                };
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        reader.position = None;
                        return Err(connection_error(&partition, &e));
                    },
                };
                if let Some(record) = to_record(&message) {
                    batch.push(record);
                }
                // Anything already buffered by librdkafka arrives immediately.
                wait = Duration::from_millis(10);
            }

            if let Some(last) = batch.last() {
                reader.position = Some(last.offset.saturating_add(1));
            }

            tracing::trace!(
                partition = %partition,
                from_offset,
                records = batch.len(),
                "Fetched batch"
            );
            Ok(batch)
        })
    }

    fn append(
        &self,
        partition: &PartitionId,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>> {
        let partition = partition.clone();
        let key = key.to_string();
        Box::pin(async move {
            let record = FutureRecord::to(partition.topic())
                .partition(kafka_partition(&partition)?)
                .key(&key)
                .payload(&payload);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((_, offset)) => {
                    tracing::debug!(partition = %partition, offset, key = %key, "Record appended");
                    u64::try_from(offset).map_err(|_| {
                        ConnectionError::Transport(format!("broker returned offset {offset}"))
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(partition = %partition, error = %kafka_error, "Failed to append record");
                    Err(connection_error(&partition, &kafka_error))
                },
            }
        })
    }

    fn high_watermark(
        &self,
        partition: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ConnectionError>> + Send + '_>> {
        let partition = partition.clone();
        let producer = self.producer.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let kafka_partition = kafka_partition(&partition)?;
            let topic = partition.topic().to_string();
            let watermarks = tokio::task::spawn_blocking(move || {
                producer.client().fetch_watermarks(&topic, kafka_partition, timeout)
            })
            .await
            .map_err(|e| ConnectionError::Transport(format!("watermark lookup aborted: {e}")))?;

            let (_, high) = watermarks.map_err(|e| connection_error(&partition, &e))?;
            Ok(u64::try_from(high).unwrap_or_default())
        })
    }
}
