//! Bounded buffer for events that arrived ahead of their predecessor.
//!
//! Keyed by aggregate, then by sequence number, so releasing the next
//! expected event and finding the oldest entry are both cheap. Capacity is
//! counted in events across all aggregates of a partition.

use chrono::{DateTime, Utc};
use staffing_views_core::event::DomainEvent;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// An event parked in the reorder buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    /// The parked event
    pub event: DomainEvent,
    /// Log offset the event was read at, when it came from a log
    pub offset: Option<u64>,
    /// When the event was parked
    pub buffered_at: DateTime<Utc>,
}

/// Outcome of [`ReorderBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// The event is now parked
    Buffered,
    /// The same aggregate/sequence was already parked; nothing changed
    AlreadyBuffered,
    /// The buffer is at capacity; the event was not parked
    Full,
}

/// Per-partition reorder buffer.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    capacity: usize,
    len: usize,
    by_aggregate: HashMap<String, BTreeMap<u64, BufferedEvent>>,
}

impl ReorderBuffer {
    /// Create a buffer holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            by_aggregate: HashMap::new(),
        }
    }

    /// Number of parked events.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is parked.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of parked events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Park an event.
    pub fn insert(&mut self, buffered: BufferedEvent) -> Insert {
        let key = buffered.event.sequence_number;
        if self
            .by_aggregate
            .get(&buffered.event.aggregate_id)
            .is_some_and(|parked| parked.contains_key(&key))
        {
            return Insert::AlreadyBuffered;
        }
        if self.len >= self.capacity {
            return Insert::Full;
        }

        self.by_aggregate
            .entry(buffered.event.aggregate_id.clone())
            .or_default()
            .insert(key, buffered);
        self.len += 1;
        Insert::Buffered
    }

    /// Remove and return the parked event `aggregate_id`/`sequence_number`.
    pub fn take(&mut self, aggregate_id: &str, sequence_number: u64) -> Option<BufferedEvent> {
        let parked = self.by_aggregate.get_mut(aggregate_id)?;
        let taken = parked.remove(&sequence_number)?;
        if parked.is_empty() {
            self.by_aggregate.remove(aggregate_id);
        }
        self.len -= 1;
        Some(taken)
    }

    /// Drop parked events of `aggregate_id` with a sequence at or below
    /// `sequence_number`; they became duplicates.
    pub fn discard_through(&mut self, aggregate_id: &str, sequence_number: u64) -> usize {
        let Some(parked) = self.by_aggregate.get_mut(aggregate_id) else {
            return 0;
        };
        let keep = parked.split_off(&sequence_number.saturating_add(1));
        let dropped = parked.len();
        *parked = keep;
        if parked.is_empty() {
            self.by_aggregate.remove(aggregate_id);
        }
        self.len -= dropped;
        dropped
    }

    /// Remove and return every event parked for longer than `timeout`.
    pub fn expire(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<BufferedEvent> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut expired = Vec::new();

        self.by_aggregate.retain(|_, parked| {
            let stale: Vec<u64> = parked
                .iter()
                .filter(|(_, entry)| now.signed_duration_since(entry.buffered_at) > timeout)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in stale {
                if let Some(entry) = parked.remove(&seq) {
                    expired.push(entry);
                }
            }
            !parked.is_empty()
        });

        self.len -= expired.len();
        expired.sort_by_key(|entry| entry.offset);
        expired
    }

    /// Lowest log offset among parked events.
    #[must_use]
    pub fn lowest_offset(&self) -> Option<u64> {
        self.by_aggregate
            .values()
            .flat_map(BTreeMap::values)
            .filter_map(|entry| entry.offset)
            .min()
    }
}
