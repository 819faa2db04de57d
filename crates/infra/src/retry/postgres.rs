//! Postgres-backed retry record store.
//!
//! Schema lives in `migrations/0001_event_retry.sql`:
//!
//! - `event_retry_records`: one row per in-flight or failed event
//! - `event_retry_attempts`: attempt history, `(event_id, attempt_number)` key,
//!   cascades on record deletion
//! - `event_retry_counters`: monotonic counters (`succeeded`) that outlive the
//!   rows they count
//!
//! ## Error Mapping
//!
//! | SQLx Error | RetryStoreError |
//! |------------|-----------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | RowNotFound | `Storage` |
//! | ColumnDecode / Decode | `Serialization` |
//! | Other | `Storage` |
//!
//! ## Runtime
//!
//! `RetryRecordStore` is synchronous; retry workers are plain OS threads.
//! The store keeps a tokio runtime handle and blocks on it per call, so it
//! must not be called from inside an async task.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{instrument, Span};

use storefront_core::EventId;

use super::policy::RetryPolicy;
use super::record::{RecordStatus, RetryAttempt, RetryRecord, RetryStatistics, RetrySubject};
use super::store::{RetryRecordStore, RetryStoreError};

const SUCCEEDED_COUNTER: &str = "succeeded";

/// Postgres-backed retry record store.
///
/// Row-level statements only; concurrent writers on different event ids never
/// contend beyond the counters row.
#[derive(Debug, Clone)]
pub struct PostgresRetryRecordStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresRetryRecordStore {
    /// Create a store bound to the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, RetryStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            RetryStoreError::Storage(
                "PostgresRetryRecordStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the bundled schema migration.
    pub async fn migrate(&self) -> Result<(), RetryStoreError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_event_retry.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, subject),
        fields(event_id = %subject.event_id),
        err
    )]
    pub async fn record_attempt(
        &self,
        subject: &RetrySubject,
        attempt_number: u32,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let policy = subject
            .policy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RetryStoreError::Serialization(format!("policy: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO event_retry_records (
                event_id,
                event_type,
                status,
                created_at,
                last_activity_at,
                payload,
                policy
            )
            VALUES ($1, $2, 'active', $3, $3, $4, $5)
            ON CONFLICT (event_id)
            DO UPDATE SET
                last_activity_at = GREATEST(event_retry_records.last_activity_at, EXCLUDED.last_activity_at)
            "#,
        )
        .bind(subject.event_id.as_uuid())
        .bind(&subject.event_type)
        .bind(at)
        .bind(&subject.payload)
        .bind(&policy)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_record", e))?;

        if attempt_number == 1 {
            restart_retained(&mut tx, subject, policy.as_ref(), at).await?;
        }

        upsert_attempt(&mut tx, subject.event_id, attempt_number, at).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(event_id = %event_id), err)]
    pub async fn record_failure(
        &self,
        event_id: EventId,
        attempt_number: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        touch_record(&mut tx, event_id, at).await?;

        sqlx::query(
            r#"
            INSERT INTO event_retry_attempts (
                event_id,
                attempt_number,
                attempted_at,
                error_message,
                failed_at
            )
            VALUES ($1, $2, $3, $4, $3)
            ON CONFLICT (event_id, attempt_number)
            DO UPDATE SET
                error_message = EXCLUDED.error_message,
                failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(attempt_number as i32)
        .bind(at)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn remove_record(&self, event_id: EventId) -> Result<bool, RetryStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let removed = sqlx::query("DELETE FROM event_retry_records WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove_record", e))?
            .rows_affected()
            > 0;

        if removed {
            sqlx::query(
                r#"
                INSERT INTO event_retry_counters (name, value)
                VALUES ($1, 1)
                ON CONFLICT (name)
                DO UPDATE SET value = event_retry_counters.value + 1
                "#,
            )
            .bind(SUCCEEDED_COUNTER)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("bump_counter", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(removed)
    }

    #[instrument(skip(self, message), fields(event_id = %event_id), err)]
    pub async fn mark_as_failed(
        &self,
        event_id: EventId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE event_retry_records
            SET status = 'failed',
                failed_at = $2,
                failure_reason = $3,
                last_activity_at = GREATEST(last_activity_at, $2)
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(at)
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_failed", e))?
        .rows_affected();

        if updated == 0 {
            return Err(RetryStoreError::NotFound(event_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn reopen(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), RetryStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE event_retry_records
            SET status = 'active',
                failed_at = NULL,
                failure_reason = NULL,
                last_activity_at = GREATEST(last_activity_at, $2)
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reopen", e))?
        .rows_affected();

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(RetryStoreError::NotFound(event_id));
        }

        sqlx::query("DELETE FROM event_retry_attempts WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("clear_attempts", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<RetryRecord>, RetryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                event_id,
                event_type,
                status,
                created_at,
                last_activity_at,
                failed_at,
                failure_reason,
                payload,
                policy
            FROM event_retry_records
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_event_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record_row = RecordRow::from_row(&row).map_err(|e| map_sqlx_error("decode_record", e))?;
        let attempts = self.load_attempts(event_id).await?;
        record_row.into_record(attempts).map(Some)
    }

    #[instrument(skip(self), fields(failed_count = tracing::field::Empty), err)]
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                event_type,
                status,
                created_at,
                last_activity_at,
                failed_at,
                failure_reason,
                payload,
                policy
            FROM event_retry_records
            WHERE status = 'failed'
            ORDER BY failed_at ASC, event_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record_row =
                RecordRow::from_row(&row).map_err(|e| map_sqlx_error("decode_record", e))?;
            let attempts = self
                .load_attempts(EventId::from_uuid(record_row.event_id))
                .await?;
            records.push(record_row.into_record(attempts)?);
        }
        Span::current().record("failed_count", records.len());
        Ok(records)
    }

    #[instrument(skip(self), err)]
    pub async fn get_statistics(&self) -> Result<RetryStatistics, RetryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded_rows,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total_records,
                (SELECT COUNT(*) FROM event_retry_attempts) AS total_attempts,
                COALESCE(
                    (SELECT value FROM event_retry_counters WHERE name = $1),
                    0
                ) AS succeeded_removed
            FROM event_retry_records
            "#,
        )
        .bind(SUCCEEDED_COUNTER)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_statistics", e))?;

        let count = |column: &str| -> Result<u64, RetryStoreError> {
            row.try_get::<i64, _>(column)
                .map(|v| v.max(0) as u64)
                .map_err(|e| map_sqlx_error("decode_statistics", e))
        };

        Ok(RetryStatistics {
            active: count("active")?,
            succeeded: count("succeeded_rows")? + count("succeeded_removed")?,
            failed: count("failed")?,
            total_attempts: count("total_attempts")?,
            total_records: count("total_records")?,
        })
    }

    #[instrument(skip(self), fields(cutoff = %cutoff, deleted = tracing::field::Empty), err)]
    pub async fn delete_old_records(&self, cutoff: DateTime<Utc>) -> Result<u64, RetryStoreError> {
        let deleted = sqlx::query("DELETE FROM event_retry_records WHERE last_activity_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_old_records", e))?
            .rows_affected();

        Span::current().record("deleted", deleted);
        Ok(deleted)
    }

    async fn load_attempts(&self, event_id: EventId) -> Result<Vec<RetryAttempt>, RetryStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT attempt_number, attempted_at, error_message, failed_at
            FROM event_retry_attempts
            WHERE event_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_attempts", e))?;

        rows.iter()
            .map(|row| {
                AttemptRow::from_row(row)
                    .map(RetryAttempt::from)
                    .map_err(|e| map_sqlx_error("decode_attempt", e))
            })
            .collect()
    }
}

async fn upsert_attempt(
    tx: &mut Transaction<'_, Postgres>,
    event_id: EventId,
    attempt_number: u32,
    at: DateTime<Utc>,
) -> Result<(), RetryStoreError> {
    sqlx::query(
        r#"
        INSERT INTO event_retry_attempts (event_id, attempt_number, attempted_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id, attempt_number)
        DO UPDATE SET attempted_at = EXCLUDED.attempted_at
        "#,
    )
    .bind(event_id.as_uuid())
    .bind(attempt_number as i32)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_attempt", e))?;
    Ok(())
}

/// A first attempt on a retained (failed) row begins a new sequence: reset the
/// row to active and drop the previous attempt history.
async fn restart_retained(
    tx: &mut Transaction<'_, Postgres>,
    subject: &RetrySubject,
    policy: Option<&JsonValue>,
    at: DateTime<Utc>,
) -> Result<(), RetryStoreError> {
    let restarted = sqlx::query(
        r#"
        UPDATE event_retry_records
        SET status = 'active',
            event_type = $2,
            failed_at = NULL,
            failure_reason = NULL,
            payload = COALESCE($3, payload),
            policy = COALESCE($4, policy),
            last_activity_at = GREATEST(last_activity_at, $5)
        WHERE event_id = $1 AND status <> 'active'
        "#,
    )
    .bind(subject.event_id.as_uuid())
    .bind(&subject.event_type)
    .bind(&subject.payload)
    .bind(policy)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("restart_record", e))?
    .rows_affected();

    if restarted > 0 {
        sqlx::query("DELETE FROM event_retry_attempts WHERE event_id = $1")
            .bind(subject.event_id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("restart_attempts", e))?;
    }
    Ok(())
}

/// Bump `last_activity_at`; `NotFound` when the record does not exist.
async fn touch_record(
    tx: &mut Transaction<'_, Postgres>,
    event_id: EventId,
    at: DateTime<Utc>,
) -> Result<(), RetryStoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE event_retry_records
        SET last_activity_at = GREATEST(last_activity_at, $2)
        WHERE event_id = $1
        "#,
    )
    .bind(event_id.as_uuid())
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("touch_record", e))?
    .rows_affected();

    if updated == 0 {
        return Err(RetryStoreError::NotFound(event_id));
    }
    Ok(())
}

/// Map SQLx errors to RetryStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RetryStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            RetryStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            RetryStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            RetryStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        err @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            RetryStoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => RetryStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct RecordRow {
    event_id: uuid::Uuid,
    event_type: String,
    status: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    payload: Option<serde_json::Value>,
    policy: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            failed_at: row.try_get("failed_at")?,
            failure_reason: row.try_get("failure_reason")?,
            payload: row.try_get("payload")?,
            policy: row.try_get("policy")?,
        })
    }
}

impl RecordRow {
    fn into_record(self, attempts: Vec<RetryAttempt>) -> Result<RetryRecord, RetryStoreError> {
        let status = RecordStatus::parse(&self.status).ok_or_else(|| {
            RetryStoreError::Serialization(format!("unknown record status '{}'", self.status))
        })?;
        let policy = self
            .policy
            .map(serde_json::from_value::<RetryPolicy>)
            .transpose()
            .map_err(|e| RetryStoreError::Serialization(format!("policy: {e}")))?;

        Ok(RetryRecord {
            event_id: EventId::from_uuid(self.event_id),
            event_type: self.event_type,
            attempts,
            status,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            failed_at: self.failed_at,
            failure_reason: self.failure_reason,
            payload: self.payload,
            policy,
        })
    }
}

#[derive(Debug)]
struct AttemptRow {
    attempt_number: i32,
    attempted_at: DateTime<Utc>,
    error_message: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AttemptRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(AttemptRow {
            attempt_number: row.try_get("attempt_number")?,
            attempted_at: row.try_get("attempted_at")?,
            error_message: row.try_get("error_message")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl From<AttemptRow> for RetryAttempt {
    fn from(row: AttemptRow) -> Self {
        RetryAttempt {
            attempt_number: row.attempt_number.max(0) as u32,
            attempted_at: row.attempted_at,
            error_message: row.error_message,
            failed_at: row.failed_at,
        }
    }
}

// Implement RetryRecordStore trait

impl RetryRecordStore for PostgresRetryRecordStore {
    fn record_attempt(
        &self,
        subject: &RetrySubject,
        attempt_number: u32,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::record_attempt(self, subject, attempt_number, at))
    }

    fn record_failure(
        &self,
        event_id: EventId,
        attempt_number: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        self.runtime.block_on(PostgresRetryRecordStore::record_failure(
            self,
            event_id,
            attempt_number,
            message,
            at,
        ))
    }

    fn remove_record(&self, event_id: EventId) -> Result<bool, RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::remove_record(self, event_id))
    }

    fn mark_as_failed(
        &self,
        event_id: EventId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::mark_as_failed(self, event_id, message, at))
    }

    fn reopen(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::reopen(self, event_id, at))
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::find_by_event_id(self, event_id))
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::list_failed(self, limit))
    }

    fn get_statistics(&self) -> Result<RetryStatistics, RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::get_statistics(self))
    }

    fn delete_old_records(&self, cutoff: DateTime<Utc>) -> Result<u64, RetryStoreError> {
        self.runtime
            .block_on(PostgresRetryRecordStore::delete_old_records(self, cutoff))
    }
}
