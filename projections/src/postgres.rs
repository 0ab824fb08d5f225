//! `PostgreSQL` view and offset storage.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE projection_rows (
//!     aggregate_id TEXT PRIMARY KEY,
//!     last_applied_sequence BIGINT NOT NULL,
//!     derived_fields JSONB NOT NULL,
//!     tombstoned BOOLEAN NOT NULL DEFAULT FALSE,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE consumer_offsets (
//!     partition_id TEXT PRIMARY KEY,
//!     committed_sequence BIGINT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Both live in the read-side database. Run [`PostgresViewStore::migrate`]
//! once before use.
//!
//! # Example
//!
//! ```ignore
//! let views = PostgresViewStore::connect("postgres://localhost/views", 10).await?;
//! views.migrate().await?;
//! let offsets = PostgresOffsetStore::new(views.pool().clone());
//! ```

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use staffing_views_core::partition::PartitionId;
use staffing_views_core::projection::{
    ConsumerOffset, OffsetStore, ProjectionRow, Result, StoreError, UpsertOutcome, ViewFilter,
    ViewStore,
};
use std::future::Future;
use std::pin::Pin;

fn backend(context: &str, err: &sqlx::Error) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn to_db_sequence(sequence: u64) -> Result<i64> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::Serialization(format!("sequence {sequence} exceeds BIGINT")))
}

fn from_db_sequence(sequence: i64) -> Result<u64> {
    u64::try_from(sequence)
        .map_err(|_| StoreError::Serialization(format!("negative sequence {sequence} in storage")))
}

#[derive(sqlx::FromRow)]
struct ViewRecord {
    aggregate_id: String,
    last_applied_sequence: i64,
    derived_fields: Json<Value>,
    tombstoned: bool,
    updated_at: DateTime<Utc>,
}

impl ViewRecord {
    fn into_row(self) -> Result<ProjectionRow> {
        let Value::Object(derived_fields) = self.derived_fields.0 else {
            return Err(StoreError::Serialization(format!(
                "derived fields of {} are not an object",
                self.aggregate_id
            )));
        };
        Ok(ProjectionRow {
            last_applied_sequence: from_db_sequence(self.last_applied_sequence)?,
            aggregate_id: self.aggregate_id,
            derived_fields,
            tombstoned: self.tombstoned,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_ROWS: &str = "SELECT aggregate_id, last_applied_sequence, derived_fields, tombstoned, updated_at FROM projection_rows";

/// PostgreSQL-backed [`ViewStore`].
///
/// Upserts are compare-and-swap on `last_applied_sequence`: the conflict
/// update only fires when the incoming sequence is higher, so a stale
/// writer affects zero rows and gets [`UpsertOutcome::Stale`].
#[derive(Clone)]
pub struct PostgresViewStore {
    pool: PgPool,
}

impl PostgresViewStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the read-side database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| backend("Failed to connect", &e))?;
        Ok(Self::new(pool))
    }

    /// Create `projection_rows` and `consumer_offsets` if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        // Other crates migrate the same database.
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn build_query(filter: &ViewFilter) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(SELECT_ROWS);
        builder.push(" WHERE TRUE");

        if let Some(prefix) = &filter.aggregate_id_prefix {
            builder.push(" AND starts_with(aggregate_id, ");
            builder.push_bind(prefix.clone());
            builder.push(")");
        }
        for (field, value) in &filter.field_equals {
            builder.push(" AND derived_fields -> ");
            builder.push_bind(field.clone());
            builder.push(" = ");
            builder.push_bind(Json(value.clone()));
        }
        if !filter.include_tombstoned {
            builder.push(" AND NOT tombstoned");
        }
        builder.push(" ORDER BY aggregate_id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        builder
    }
}

impl ViewStore for PostgresViewStore {
    fn upsert(
        &self,
        row: ProjectionRow,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>> {
        Box::pin(async move {
            let sequence = to_db_sequence(row.last_applied_sequence)?;
            let result = sqlx::query(
                "INSERT INTO projection_rows (aggregate_id, last_applied_sequence, derived_fields, tombstoned, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (aggregate_id) DO UPDATE
                 SET last_applied_sequence = EXCLUDED.last_applied_sequence,
                     derived_fields = EXCLUDED.derived_fields,
                     tombstoned = EXCLUDED.tombstoned,
                     updated_at = EXCLUDED.updated_at
                 WHERE projection_rows.last_applied_sequence < EXCLUDED.last_applied_sequence",
            )
            .bind(&row.aggregate_id)
            .bind(sequence)
            .bind(Json(Value::Object(row.derived_fields)))
            .bind(row.tombstoned)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to upsert projection row", &e))?;

            if result.rows_affected() == 0 {
                tracing::debug!(
                    aggregate_id = %row.aggregate_id,
                    sequence = row.last_applied_sequence,
                    "Stale upsert rejected"
                );
                Ok(UpsertOutcome::Stale)
            } else {
                Ok(UpsertOutcome::Written)
            }
        })
    }

    fn get(
        &self,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionRow>>> + Send + '_>> {
        let aggregate_id = aggregate_id.to_string();
        Box::pin(async move {
            let record: Option<ViewRecord> =
                sqlx::query_as(&format!("{SELECT_ROWS} WHERE aggregate_id = $1"))
                    .bind(aggregate_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| backend("Failed to load projection row", &e))?;
            record.map(ViewRecord::into_row).transpose()
        })
    }

    fn query(&self, filter: ViewFilter) -> BoxStream<'_, Result<ProjectionRow>> {
        Box::pin(async_stream::stream! {
            let mut builder = Self::build_query(&filter);
            let mut records = builder.build_query_as::<ViewRecord>().fetch(&self.pool);
            while let Some(next) = records.next().await {
                yield next
                    .map_err(|e| backend("Failed to query projection rows", &e))
                    .and_then(ViewRecord::into_row);
            }
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("TRUNCATE projection_rows")
                .execute(&self.pool)
                .await
                .map_err(|e| backend("Failed to clear projection rows", &e))?;
            Ok(())
        })
    }
}

/// PostgreSQL-backed [`OffsetStore`].
///
/// Commits use `GREATEST`, so a late or duplicated commit never moves a
/// checkpoint backwards.
#[derive(Clone)]
pub struct PostgresOffsetStore {
    pool: PgPool,
}

impl PostgresOffsetStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl OffsetStore for PostgresOffsetStore {
    fn load(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ConsumerOffset>>> + Send + '_>> {
        let partition_id = partition_id.clone();
        Box::pin(async move {
            let stored: Option<(i64,)> = sqlx::query_as(
                "SELECT committed_sequence FROM consumer_offsets WHERE partition_id = $1",
            )
            .bind(partition_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("Failed to load checkpoint", &e))?;

            stored
                .map(|(sequence,)| Ok(ConsumerOffset::new(partition_id, from_db_sequence(sequence)?)))
                .transpose()
        })
    }

    fn commit(
        &self,
        offset: ConsumerOffset,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO consumer_offsets (partition_id, committed_sequence, updated_at)
                 VALUES ($1, $2, now())
                 ON CONFLICT (partition_id) DO UPDATE
                 SET committed_sequence = GREATEST(consumer_offsets.committed_sequence, EXCLUDED.committed_sequence),
                     updated_at = now()",
            )
            .bind(offset.partition_id.to_string())
            .bind(to_db_sequence(offset.committed_sequence)?)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to commit checkpoint", &e))?;
            Ok(())
        })
    }

    fn reset(
        &self,
        partition_id: &PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = partition_id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM consumer_offsets WHERE partition_id = $1")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("Failed to reset checkpoint", &e))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_outside_bigint_are_rejected() {
        assert!(to_db_sequence(u64::MAX).is_err());
        assert_eq!(to_db_sequence(42), Ok(42));
        assert!(from_db_sequence(-1).is_err());
    }

    #[test]
    fn query_sql_reflects_filter() {
        let filter = ViewFilter::new()
            .aggregate_id_prefix("B")
            .field_equals("status", "OPEN")
            .limit(5);
        let builder = PostgresViewStore::build_query(&filter);
        let sql = builder.sql();

        assert!(sql.contains("starts_with(aggregate_id, $1)"));
        assert!(sql.contains("derived_fields -> $2 = $3"));
        assert!(sql.contains("AND NOT tombstoned"));
        assert!(sql.ends_with("ORDER BY aggregate_id LIMIT $4"));
    }

    #[test]
    fn non_object_fields_fail_to_load() {
        let record = ViewRecord {
            aggregate_id: "B1".to_string(),
            last_applied_sequence: 0,
            derived_fields: Json(Value::Null),
            tombstoned: false,
            updated_at: Utc::now(),
        };
        assert!(matches!(record.into_row(), Err(StoreError::Serialization(_))));
    }
}
