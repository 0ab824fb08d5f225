//! Partition identity and the aggregate-to-partition mapping.
//!
//! Every event of one aggregate lands in the same partition of its topic,
//! which is what gives the view side per-aggregate ordering for free. The
//! mapping is FNV-1a over the aggregate id, modulo the partition count, so
//! producers and tests agree on placement without talking to the broker.

use crate::event::AggregateType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Error returned when a partition id string is not `topic/partition`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid partition id: {0}")]
pub struct InvalidPartitionId(pub String);

/// One ordered partition of one topic.
///
/// Displays as `topic/partition`, which is also the key offsets are stored
/// under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    topic: String,
    partition: u32,
}

impl PartitionId {
    /// Create a partition id.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Partition owning `aggregate_id` within its aggregate type's topic.
    #[must_use]
    pub fn for_aggregate(
        aggregate_type: AggregateType,
        aggregate_id: &str,
        partition_count: u32,
    ) -> Self {
        Self::new(
            aggregate_type.topic(),
            partition_for(aggregate_id, partition_count),
        )
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition number within the topic.
    #[must_use]
    pub const fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

impl FromStr for PartitionId {
    type Err = InvalidPartitionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (topic, partition) = s
            .rsplit_once('/')
            .ok_or_else(|| InvalidPartitionId(s.to_string()))?;
        if topic.is_empty() {
            return Err(InvalidPartitionId(s.to_string()));
        }
        let partition = partition
            .parse()
            .map_err(|_| InvalidPartitionId(s.to_string()))?;
        Ok(Self::new(topic, partition))
    }
}

/// Partition number for an aggregate id.
///
/// A `partition_count` of zero is treated as one.
#[must_use]
pub fn partition_for(aggregate_id: &str, partition_count: u32) -> u32 {
    fnv1a(aggregate_id.as_bytes()) % partition_count.max(1)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
