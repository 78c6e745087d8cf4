//! Durable local mutation queue.
//!
//! One row per outstanding local mutation. Enqueueing applies the
//! engine's coalescing decision inside a single transaction, so the queue
//! invariant (at most one coalescible entry per record, carrying the
//! latest payload) holds across process restarts and concurrent callers.
//! Entries currently being pushed (`syncing`) are in-flight and excluded
//! from coalescing; a mutation arriving mid-push queues behind them.

use chrono::Utc;
use satchel_engine::{
    coalesce, ChangeAction, CoalesceDecision, QueueStatus, QueuedOperation, RetryPolicy,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Store for the sync queue table.
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

struct QueueRow {
    id: String,
    table_name: String,
    record_id: String,
    operation: String,
    payload: String,
    created_at: i64,
    retry_count: i64,
    last_error: Option<String>,
    status: String,
    last_known_remote_updated_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for QueueRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(QueueRow {
            id: row.try_get("id")?,
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            operation: row.try_get("operation")?,
            payload: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            status: row.try_get("status")?,
            last_known_remote_updated_at: row.try_get("last_known_remote_updated_at")?,
        })
    }
}

impl QueueRow {
    fn into_operation(self) -> Result<QueuedOperation> {
        let mut op = QueuedOperation::new(
            self.id,
            self.table_name,
            self.record_id,
            ChangeAction::from_str(&self.operation)?,
            serde_json::from_str(&self.payload)?,
            self.created_at,
        );
        op.retry_count = self.retry_count as u32;
        op.last_error = self.last_error;
        op.status = QueueStatus::from_str(&self.status)?;
        op.last_known_remote_updated_at = self.last_known_remote_updated_at;
        Ok(op)
    }
}

const SELECT_COLUMNS: &str = "id, table_name, record_id, operation, data, created_at, \
                              retry_count, last_error, status, last_known_remote_updated_at";

impl QueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a local mutation, coalescing with any existing entry for
    /// the same (table, record) pair.
    ///
    /// Returns the authoritative entry after coalescing, or `None` when a
    /// delete cancelled an un-synced insert and nothing remains to push.
    pub async fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        operation: ChangeAction,
        payload: serde_json::Value,
        last_known_remote_updated_at: Option<i64>,
    ) -> Result<Option<QueuedOperation>> {
        let mut tx = self.pool.begin().await?;
        let result = Self::enqueue_in_tx(
            &mut tx,
            table,
            record_id,
            operation,
            payload,
            last_known_remote_updated_at,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Enqueue inside an existing transaction (repository path).
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        table: &str,
        record_id: &str,
        operation: ChangeAction,
        payload: serde_json::Value,
        last_known_remote_updated_at: Option<i64>,
    ) -> Result<Option<QueuedOperation>> {
        let existing = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND status IN ('pending', 'failed')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(QueueRow::into_operation)
        .transpose()?;

        let payload_text = serde_json::to_string(&payload)?;
        let now = Utc::now().timestamp_millis();

        match coalesce(existing.as_ref(), operation) {
            CoalesceDecision::Append => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO sync_queue (
                        id, table_name, record_id, operation, data,
                        created_at, retry_count, status, last_known_remote_updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending', ?7)
                    "#,
                )
                .bind(&id)
                .bind(table)
                .bind(record_id)
                .bind(operation.as_str())
                .bind(&payload_text)
                .bind(now)
                .bind(last_known_remote_updated_at)
                .execute(&mut **tx)
                .await?;

                let mut op =
                    QueuedOperation::new(id, table, record_id, operation, payload, now);
                op.last_known_remote_updated_at = last_known_remote_updated_at;
                Ok(Some(op))
            }
            CoalesceDecision::MergePayload => {
                // Entry keeps its kind and FIFO position; the payload and
                // retry bookkeeping start over.
                let mut entry = existing.unwrap_or_else(|| unreachable!());
                sqlx::query(
                    r#"
                    UPDATE sync_queue
                    SET data = ?1, retry_count = 0, last_error = NULL,
                        status = 'pending', next_attempt_at = NULL,
                        last_known_remote_updated_at = COALESCE(?2, last_known_remote_updated_at)
                    WHERE id = ?3
                    "#,
                )
                .bind(&payload_text)
                .bind(last_known_remote_updated_at)
                .bind(&entry.id)
                .execute(&mut **tx)
                .await?;

                entry.payload = payload;
                entry.retry_count = 0;
                entry.last_error = None;
                entry.status = QueueStatus::Pending;
                if last_known_remote_updated_at.is_some() {
                    entry.last_known_remote_updated_at = last_known_remote_updated_at;
                }
                Ok(Some(entry))
            }
            CoalesceDecision::PromoteToDelete => {
                let mut entry = existing.unwrap_or_else(|| unreachable!());
                sqlx::query(
                    r#"
                    UPDATE sync_queue
                    SET operation = 'DELETE', data = '{}', retry_count = 0,
                        last_error = NULL, status = 'pending', next_attempt_at = NULL
                    WHERE id = ?1
                    "#,
                )
                .bind(&entry.id)
                .execute(&mut **tx)
                .await?;

                entry.operation = ChangeAction::Delete;
                entry.payload = serde_json::json!({});
                entry.retry_count = 0;
                entry.last_error = None;
                entry.status = QueueStatus::Pending;
                Ok(Some(entry))
            }
            CoalesceDecision::Cancel => {
                let entry = existing.unwrap_or_else(|| unreachable!());
                sqlx::query(r#"DELETE FROM sync_queue WHERE id = ?1"#)
                    .bind(&entry.id)
                    .execute(&mut **tx)
                    .await?;
                tracing::debug!(
                    table,
                    record_id,
                    "delete cancelled un-synced insert, queue entry dropped"
                );
                Ok(None)
            }
            CoalesceDecision::Ignore => {
                tracing::debug!(
                    table,
                    record_id,
                    "mutation after queued delete ignored"
                );
                Ok(existing)
            }
        }
    }

    /// Take the oldest pending entry, flipping it to `syncing`.
    pub async fn dequeue_next(&self) -> Result<Option<QueuedOperation>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sync_queue
            WHERE status = 'pending'
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query(r#"UPDATE sync_queue SET status = 'syncing' WHERE id = ?1"#)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut op = row.into_operation()?;
        op.status = QueueStatus::Syncing;
        Ok(Some(op))
    }

    /// Remove an entry acknowledged by the remote.
    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM sync_queue WHERE id = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ClientError::QueueEntryNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failed push attempt: increment the retry count, store the
    /// error, and schedule the next attempt per the policy.
    pub async fn mark_failed(&self, id: &str, error: &str, policy: &RetryPolicy) -> Result<()> {
        let row = sqlx::query(r#"SELECT retry_count FROM sync_queue WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClientError::QueueEntryNotFound(id.to_string()))?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let attempts = retry_count as u32 + 1;

        let now = Utc::now().timestamp_millis();
        let next_attempt_at = now + policy.delay_ms(attempts);

        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'failed', retry_count = ?1, last_error = ?2, next_attempt_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(attempts as i64)
        .bind(error)
        .bind(next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag an entry as a conflict requiring manual resolution.
    pub async fn mark_conflict(&self, id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE sync_queue SET status = 'conflict', last_error = ?1 WHERE id = ?2"#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move backoff-elapsed failures back to pending; surface
    /// retry-exhausted ones as conflicts. Returns how many became
    /// pending again.
    pub async fn release_due_retries(&self, now: i64, policy: &RetryPolicy) -> Result<u64> {
        let exhausted = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'conflict',
                last_error = COALESCE(last_error, 'retry limit reached')
            WHERE status = 'failed' AND retry_count >= ?1
            "#,
        )
        .bind(policy.max_attempts as i64)
        .execute(&self.pool)
        .await?;
        if exhausted.rows_affected() > 0 {
            tracing::warn!(
                count = exhausted.rows_affected(),
                "queue entries exhausted retries, surfaced as conflicts"
            );
        }

        let released = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending'
            WHERE status = 'failed'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(released.rows_affected())
    }

    /// Recover entries stranded in `syncing` by an interrupted pass.
    pub async fn release_stranded(&self) -> Result<u64> {
        let result =
            sqlx::query(r#"UPDATE sync_queue SET status = 'pending' WHERE status = 'syncing'"#)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// The coalescible (pending / failed) entry for a record, if any.
    pub async fn pending_for(&self, table: &str, record_id: &str) -> Result<Option<QueuedOperation>> {
        sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND status IN ('pending', 'syncing', 'failed')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(table)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?
        .map(QueueRow::into_operation)
        .transpose()
    }

    /// Entries waiting to be pushed (pending + retrying).
    pub async fn pending_count(&self) -> Result<u64> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS count FROM sync_queue WHERE status IN ('pending', 'syncing', 'failed')"#,
        )
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// Entries requiring manual resolution.
    pub async fn conflict_count(&self) -> Result<u64> {
        let row =
            sqlx::query(r#"SELECT COUNT(*) AS count FROM sync_queue WHERE status = 'conflict'"#)
                .fetch_one(&self.pool)
                .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// All conflict entries, oldest first.
    pub async fn list_conflicts(&self) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sync_queue
            WHERE status = 'conflict'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueRow::into_operation).collect()
    }

    /// Manually resolve a conflict entry.
    ///
    /// `keep_local` re-queues the discarded payload for another push;
    /// otherwise the entry is dropped and the remote version stands.
    pub async fn resolve_conflict(&self, id: &str, keep_local: bool) -> Result<()> {
        if keep_local {
            let result = sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'pending', retry_count = 0, last_error = NULL,
                    next_attempt_at = NULL, last_known_remote_updated_at = NULL
                WHERE id = ?1 AND status = 'conflict'
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(ClientError::QueueEntryNotFound(id.to_string()));
            }
        } else {
            let result =
                sqlx::query(r#"DELETE FROM sync_queue WHERE id = ?1 AND status = 'conflict'"#)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(ClientError::QueueEntryNotFound(id.to_string()));
            }
        }
        Ok(())
    }

    /// Reset all failed entries for immediate retry.
    pub async fn retry_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', next_attempt_at = NULL
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
