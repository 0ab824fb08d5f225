//! Dead Letter Queue (DLQ) for records the view pipeline gave up on.
//!
//! Keeps the raw envelope bytes next to the failure kind, reason and retry
//! count so an operator can inspect, fix and replay a record, then resolve
//! or discard the entry.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use staffing_views_core::dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterSink, DeadLetterStatus, FailureKind,
};
use staffing_views_core::partition::PartitionId;
use std::future::Future;
use std::pin::Pin;

const SELECT_ENTRIES: &str = r"
    SELECT
        id, partition_id, log_offset, aggregate_id, payload, failure_kind, reason,
        retry_count, failed_at, status, resolved_at, resolved_by, resolution_notes
    FROM dead_letters
";

fn storage(err: &sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(err.to_string())
}

/// A stored dead letter with its triage state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Unique id of the entry
    pub id: i64,

    /// The dead letter itself
    pub letter: DeadLetter,

    /// Current triage status
    pub status: DeadLetterStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed dead-letter queue.
///
/// # Example
///
/// ```no_run
/// use staffing_views_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} at {}: {}", entry.letter.partition, entry.letter.offset, entry.letter.reason);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `dead_letters` table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the migration fails.
    pub async fn migrate(&self) -> Result<(), DeadLetterError> {
        // Other crates migrate the same database.
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Store a dead letter, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add(&self, letter: &DeadLetter) -> Result<i64, DeadLetterError> {
        let offset = i64::try_from(letter.offset)
            .map_err(|_| DeadLetterError::Storage(format!("offset {} exceeds BIGINT", letter.offset)))?;
        let retry_count = i32::try_from(letter.retry_count).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                partition_id, log_offset, aggregate_id, payload, failure_kind,
                reason, retry_count, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(letter.partition.to_string())
        .bind(offset)
        .bind(letter.aggregate_id.as_deref())
        .bind(&letter.payload)
        .bind(letter.kind.as_str())
        .bind(&letter.reason)
        .bind(retry_count)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        tracing::warn!(
            dlq_id = id,
            partition = %letter.partition,
            offset = letter.offset,
            kind = letter.kind.as_str(),
            reason = %letter.reason,
            retry_count = letter.retry_count,
            "Record added to dead-letter queue"
        );

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRIES} WHERE status = $1 ORDER BY failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<DeadLetterEntry, DeadLetterError> {
        let row = sqlx::query(&format!("{SELECT_ENTRIES} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage(&e))?
            .ok_or(DeadLetterError::NotFound(id))?;

        Self::row_to_entry(&row)
    }

    /// Mark an entry resolved, e.g. after replaying it.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("view.dead_letter.resolved").increment(1);
        Ok(())
    }

    /// Mark an entry discarded: it will never be replayed.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("view.dead_letter.discarded").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage(&e))?;
        Ok(count)
    }

    fn row_to_entry(row: &PgRow) -> Result<DeadLetterEntry, DeadLetterError> {
        let partition: String = row.try_get("partition_id").map_err(|e| storage(&e))?;
        let partition = partition
            .parse::<PartitionId>()
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        let kind: String = row.try_get("failure_kind").map_err(|e| storage(&e))?;
        let kind = FailureKind::parse(&kind)
            .ok_or_else(|| DeadLetterError::Storage(format!("Invalid failure kind: {kind}")))?;

        let status: String = row.try_get("status").map_err(|e| storage(&e))?;
        let status = DeadLetterStatus::parse(&status)
            .ok_or_else(|| DeadLetterError::Storage(format!("Invalid dead-letter status: {status}")))?;

        let offset: i64 = row.try_get("log_offset").map_err(|e| storage(&e))?;
        let retry_count: i32 = row.try_get("retry_count").map_err(|e| storage(&e))?;

        Ok(DeadLetterEntry {
            id: row.try_get("id").map_err(|e| storage(&e))?,
            letter: DeadLetter {
                partition,
                offset: u64::try_from(offset).unwrap_or_default(),
                aggregate_id: row.try_get("aggregate_id").map_err(|e| storage(&e))?,
                payload: row.try_get("payload").map_err(|e| storage(&e))?,
                kind,
                reason: row.try_get("reason").map_err(|e| storage(&e))?,
                retry_count: u32::try_from(retry_count).unwrap_or_default(),
                failed_at: row.try_get("failed_at").map_err(|e| storage(&e))?,
            },
            status,
            resolved_at: row.try_get("resolved_at").map_err(|e| storage(&e))?,
            resolved_by: row.try_get("resolved_by").map_err(|e| storage(&e))?,
            resolution_notes: row.try_get("resolution_notes").map_err(|e| storage(&e))?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.add(&letter).await })
    }
}
