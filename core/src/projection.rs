//! Projection rows and the storage seams of the read side.
//!
//! # Overview
//!
//! The view is one [`ProjectionRow`] per aggregate, folded from that
//! aggregate's events in sequence order. Two stores back the pipeline:
//!
//! - [`ViewStore`]: the rows themselves, shared by every partition worker and
//!   read by the Read API
//! - [`OffsetStore`]: one [`ConsumerOffset`] per partition, the durable
//!   checkpoint a worker resumes from
//!
//! ```text
//!  event log ──► partition worker ──► ViewStore::upsert ──► OffsetStore::commit
//!                                          │
//!                                          ▼
//!                                  Read API (get / query)
//! ```
//!
//! The offset is only committed after the upsert it covers has returned, so
//! a crash between the two replays events rather than losing them.
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` so they can be shared as
//! `Arc<dyn ViewStore>` / `Arc<dyn OffsetStore>` across worker tasks.

use crate::fold::DerivedFields;
use crate::partition::PartitionId;
use crate::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Error type for view and offset storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Storage backend error (connection, query, constraint)
    #[error("Storage error: {0}")]
    Backend(String),

    /// A stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The materialized state of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    /// Aggregate this row is folded from
    pub aggregate_id: String,

    /// Sequence number of the last event folded into this row
    pub last_applied_sequence: u64,

    /// Fields derived from the folded events
    pub derived_fields: DerivedFields,

    /// Set once a tombstone event has been applied
    pub tombstoned: bool,

    /// When the row was last written
    pub updated_at: DateTime<Utc>,
}

impl ProjectionRow {
    /// Create a live row.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        last_applied_sequence: u64,
        derived_fields: DerivedFields,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            last_applied_sequence,
            derived_fields,
            tombstoned: false,
            updated_at: Utc::now(),
        }
    }

    /// A derived field as a string, if present and a string.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.derived_fields.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Result of a compare-and-swap upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was inserted or replaced
    Written,
    /// The stored row already had an equal or higher sequence; nothing changed
    Stale,
}

/// Row selection for [`ViewStore::query`].
///
/// An empty filter selects every live row.
///
/// # Example
///
/// ```
/// use staffing_views_core::projection::ViewFilter;
///
/// let filter = ViewFilter::new()
///     .field_equals("status", "OPEN")
///     .field_equals("grade", "RN")
///     .limit(50);
/// assert_eq!(filter.limit, Some(50));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewFilter {
    /// Only rows whose aggregate id starts with this prefix
    pub aggregate_id_prefix: Option<String>,

    /// Only rows whose derived field equals the given JSON value
    pub field_equals: Vec<(String, serde_json::Value)>,

    /// Include tombstoned rows
    pub include_tombstoned: bool,

    /// Maximum number of rows to return
    pub limit: Option<usize>,
}

impl ViewFilter {
    /// Filter selecting every live row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to aggregate ids starting with `prefix`.
    #[must_use]
    pub fn aggregate_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.aggregate_id_prefix = Some(prefix.into());
        self
    }

    /// Restrict to rows where `field` equals `value`.
    #[must_use]
    pub fn field_equals(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.field_equals.push((field.into(), value.into()));
        self
    }

    /// Also return tombstoned rows.
    #[must_use]
    pub const fn include_tombstoned(mut self) -> Self {
        self.include_tombstoned = true;
        self
    }

    /// Cap the number of rows returned.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` is selected (ignores `limit`).
    #[must_use]
    pub fn matches(&self, row: &ProjectionRow) -> bool {
        if row.tombstoned && !self.include_tombstoned {
            return false;
        }
        if let Some(prefix) = &self.aggregate_id_prefix {
            if !row.aggregate_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.field_equals
            .iter()
            .all(|(field, value)| row.derived_fields.get(field) == Some(value))
    }
}

/// Read-optimized storage for projection rows.
///
/// # Compare-and-swap
///
/// [`upsert`](ViewStore::upsert) must only replace a stored row whose
/// `last_applied_sequence` is strictly lower than the incoming one; otherwise
/// it reports [`UpsertOutcome::Stale`] and leaves the row untouched. This
/// keeps the view correct even if two writers ever race on one aggregate.
pub trait ViewStore: Send + Sync {
    /// Insert or replace a row, guarded by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the write fails.
    fn upsert(
        &self,
        row: ProjectionRow,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>>;

    /// Point lookup by aggregate id (tombstoned rows included).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the row cannot be decoded.
    fn get(
        &self,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionRow>>> + Send + '_>>;

    /// Lazily stream the rows selected by `filter`, ordered by aggregate id.
    fn query(&self, filter: ViewFilter) -> BoxStream<'_, Result<ProjectionRow>>;

    /// Drop every row (used before a rebuild).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the delete fails.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Durable checkpoint of one partition.
///
/// `committed_sequence` is the log offset of the last record whose effects
/// are durably in the view. Consumption resumes at `committed_sequence + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOffset {
    /// Partition this checkpoint belongs to
    pub partition_id: PartitionId,

    /// Last fully applied log offset
    pub committed_sequence: u64,
}

impl ConsumerOffset {
    /// Create a checkpoint.
    #[must_use]
    pub const fn new(partition_id: PartitionId, committed_sequence: u64) -> Self {
        Self {
            partition_id,
            committed_sequence,
        }
    }

    /// First log offset not covered by this checkpoint.
    #[must_use]
    pub const fn next_offset(&self) -> u64 {
        self.committed_sequence.saturating_add(1)
    }
}

/// Durable storage of per-partition checkpoints.
pub trait OffsetStore: Send + Sync {
    /// Load the checkpoint of a partition.
    ///
    /// Returns `None` for a partition that was never committed, which means
    /// consume from offset 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn load(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ConsumerOffset>>> + Send + '_>>;

    /// Advance a checkpoint.
    ///
    /// Monotonic: committing a value lower than the stored one leaves the
    /// stored one in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the write fails.
    fn commit(
        &self,
        offset: ConsumerOffset,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Forget a partition's checkpoint so it is replayed from the start.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the delete fails.
    fn reset(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, fields: serde_json::Value) -> ProjectionRow {
        let serde_json::Value::Object(map) = fields else {
            return ProjectionRow::new(id, 0, DerivedFields::new());
        };
        ProjectionRow::new(id, 0, map)
    }

    #[test]
    fn empty_filter_hides_tombstones_only() {
        let live = row("A1", json!({ "status": "OPEN" }));
        let mut dead = row("A2", json!({ "status": "CANCELLED" }));
        dead.tombstoned = true;

        let filter = ViewFilter::new();
        assert!(filter.matches(&live));
        assert!(!filter.matches(&dead));
        assert!(filter.include_tombstoned().matches(&dead));
    }

    #[test]
    fn field_and_prefix_filters_combine() {
        let booking = row("booking-1", json!({ "status": "OPEN", "grade": "RN" }));
        let filter = ViewFilter::new()
            .aggregate_id_prefix("booking-")
            .field_equals("grade", "RN");
        assert!(filter.matches(&booking));

        let other_grade = ViewFilter::new().field_equals("grade", "HCA");
        assert!(!other_grade.matches(&booking));

        let other_prefix = ViewFilter::new().aggregate_id_prefix("carer-");
        assert!(!other_prefix.matches(&booking));
    }

    #[test]
    fn next_offset_follows_commit() {
        let offset = ConsumerOffset::new(PartitionId::new("booking-events", 0), 41);
        assert_eq!(offset.next_offset(), 42);
    }

    #[test]
    fn field_str_reads_string_fields() {
        let booking = row("A1", json!({ "status": "OPEN", "hourly_rate": 30 }));
        assert_eq!(booking.field_str("status"), Some("OPEN"));
        assert_eq!(booking.field_str("hourly_rate"), None);
    }
}
