//! Integration tests for [`RedpandaEventLog`] against a real Kafka broker.
//!
//! Marked `#[ignore]` because they need Docker and take a while to start
//! the broker. Run explicitly with:
//!
//! ```bash
//! cargo test -p staffing-views-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use staffing_views_core::codec;
use staffing_views_core::event_log::{EventLog, publish};
use staffing_views_core::partition::PartitionId;
use staffing_views_redpanda::RedpandaEventLog;
use staffing_views_testing::fixtures;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn event_log(brokers: &str) -> RedpandaEventLog {
    RedpandaEventLog::builder()
        .brokers(brokers)
        .consumer_group("view-maintenance-tests")
        .fetch_timeout(Duration::from_secs(2))
        .build()
        .expect("Failed to create event log")
}

/// Append until the topic is auto-created and the broker acknowledges.
async fn append_with_warmup(log: &RedpandaEventLog, partition: &PartitionId, key: &str, payload: Vec<u8>) -> u64 {
    for _ in 0..60 {
        if let Ok(offset) = log.append(partition, key, payload.clone()).await {
            return offset;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("broker never accepted an append to {partition}");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_published_events_fetch_back_in_order() {
    let (_kafka, brokers) = start_kafka().await;
    let log = event_log(&brokers);
    let partition = PartitionId::new("booking-events", 0);

    let created = fixtures::booking_created("B1", "RN", "Leeds", &["IV"]);
    let first = append_with_warmup(&log, &partition, "B1", codec::encode(&created).expect("encode")).await;

    let booked = fixtures::booking_booked("B1", 1, "C1");
    let (routed, second) = publish(&log, &booked, 1).await.expect("Failed to publish");
    assert_eq!(routed, partition);
    assert_eq!(second, first + 1);

    let records = log.fetch(&partition, first, 10).await.expect("Failed to fetch");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key.as_deref(), Some("B1"));
    assert_eq!(codec::decode(&records[0].payload).expect("decode"), created);
    assert_eq!(codec::decode(&records[1].payload).expect("decode"), booked);
    assert!(records[1].timestamp.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fetch_honours_offset_and_batch_size() {
    let (_kafka, brokers) = start_kafka().await;
    let log = event_log(&brokers);
    let partition = PartitionId::new("carer-events", 0);

    let base = append_with_warmup(&log, &partition, "C1", b"zero".to_vec()).await;
    for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        log.append(&partition, "C1", payload).await.expect("append");
    }

    let middle = log.fetch(&partition, base + 1, 2).await.expect("fetch");
    let offsets: Vec<u64> = middle.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![base + 1, base + 2]);

    // Continuing from where the last batch ended, then seeking backwards.
    let rest = log.fetch(&partition, base + 3, 10).await.expect("fetch");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].payload, b"three".to_vec());

    let again = log.fetch(&partition, base, 1).await.expect("fetch");
    assert_eq!(again[0].payload, b"zero".to_vec());

    let watermark = log.high_watermark(&partition).await.expect("watermark");
    assert_eq!(watermark, base + 4);

    let empty = log.fetch(&partition, watermark, 10).await.expect("fetch");
    assert!(empty.is_empty());
}
