//! The generic keyed local store the sync subsystem maintains.
//!
//! One row per (table, record) pair, holding the full entity snapshot as
//! JSON. Repository-path mutations run a single transaction that applies
//! the row change, writes the audit entry, and enqueues the outbound
//! operation. Remote-originated applications (pull, realtime) update rows
//! and audit as `system` without enqueueing — pushing them back would
//! echo.

use std::sync::Arc;

use chrono::Utc;
use satchel_engine::{ChangeAction, ChangeRecord, QueuedOperation, SYSTEM_ACTOR};
use sqlx::{Row, SqlitePool};

use crate::compat::CompatibilityGate;
use crate::db::audit::{enter_audit_scope, leave_audit_scope};
use crate::db::{AuditStore, QueueStore};
use crate::error::{ClientError, Result};
use crate::sync::SyncStatusManager;

/// A row from the records table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub table_name: String,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub site_id: Option<String>,
    pub updated_at: i64,
    pub updated_by: Option<String>,
    /// Remote `updated_at` at the time this row last agreed with the
    /// server; None for rows the remote has never acknowledged.
    pub remote_updated_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredRecord {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let payload: String = row.try_get("payload")?;
        Ok(StoredRecord {
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            payload: serde_json::from_str(&payload).map_err(|e| sqlx::Error::ColumnDecode {
                index: "payload".into(),
                source: Box::new(e),
            })?,
            site_id: row.try_get("site_id")?,
            updated_at: row.try_get("updated_at")?,
            updated_by: row.try_get("updated_by")?,
            remote_updated_at: row.try_get("remote_updated_at")?,
        })
    }
}

/// Store for local entity rows.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    status: Option<Arc<SyncStatusManager>>,
    gate: Option<Arc<CompatibilityGate>>,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            status: None,
            gate: None,
        }
    }

    /// Republish the sync status after every queue-mutating repository
    /// call.
    pub fn with_status(mut self, status: Arc<SyncStatusManager>) -> Self {
        self.status = Some(status);
        self
    }

    /// Refuse repository mutations while the session is blocked by the
    /// compatibility gate.
    pub fn with_gate(mut self, gate: Arc<CompatibilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn ensure_allowed(&self) -> Result<()> {
        match &self.gate {
            Some(gate) => gate.ensure_allowed(),
            None => Ok(()),
        }
    }

    async fn publish_status(&self) {
        if let Some(status) = &self.status {
            if let Err(error) = status.refresh().await {
                tracing::warn!(%error, "status refresh failed after mutation");
            }
        }
    }

    /// Insert or update a record through the repository path.
    ///
    /// In one transaction: the row is written, one audit entry is
    /// appended, and the mutation is enqueued for push. An audit write
    /// failure is demoted to a warning — it never rolls back the
    /// business mutation.
    pub async fn upsert(
        &self,
        table: &str,
        record_id: &str,
        mut payload: serde_json::Value,
        actor: &str,
        site_id: Option<&str>,
    ) -> Result<Option<QueuedOperation>> {
        self.ensure_allowed()?;
        if let Some(object) = payload.as_object_mut() {
            object.insert("updated_by".to_string(), serde_json::json!(actor));
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        enter_audit_scope(&mut tx).await?;

        let old = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let payload_text = serde_json::to_string(&payload)?;
        sqlx::query(
            r#"
            INSERT INTO records (table_name, record_id, payload, site_id, updated_at, updated_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(table_name, record_id) DO UPDATE SET
                payload = excluded.payload,
                site_id = excluded.site_id,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by
            "#,
        )
        .bind(table)
        .bind(record_id)
        .bind(&payload_text)
        .bind(site_id)
        .bind(now)
        .bind(actor)
        .execute(&mut *tx)
        .await?;

        let action = if old.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Insert
        };

        let audit_entry = ChangeRecord::new(
            table,
            record_id,
            action,
            old.as_ref().map(|r| r.payload.clone()),
            Some(payload.clone()),
            actor,
            site_id.map(String::from),
            now,
        );
        if let Err(error) = AuditStore::record_in_tx(&mut tx, audit_entry).await {
            tracing::warn!(table, record_id, %error, "audit write failed for mutation");
        }

        let queued = QueueStore::enqueue_in_tx(
            &mut tx,
            table,
            record_id,
            action,
            payload,
            old.as_ref().and_then(|r| r.remote_updated_at),
        )
        .await?;

        leave_audit_scope(&mut tx).await?;
        tx.commit().await?;
        self.publish_status().await;
        Ok(queued)
    }

    /// Delete a record through the repository path.
    pub async fn delete(&self, table: &str, record_id: &str, actor: &str) -> Result<()> {
        self.ensure_allowed()?;
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        enter_audit_scope(&mut tx).await?;

        let old = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ClientError::RecordNotFound {
            table: table.to_string(),
            id: record_id.to_string(),
        })?;

        sqlx::query(r#"DELETE FROM records WHERE table_name = ?1 AND record_id = ?2"#)
            .bind(table)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;

        let audit_entry = ChangeRecord::new(
            table,
            record_id,
            ChangeAction::Delete,
            Some(old.payload),
            None,
            actor,
            old.site_id.clone(),
            now,
        );
        if let Err(error) = AuditStore::record_in_tx(&mut tx, audit_entry).await {
            tracing::warn!(table, record_id, %error, "audit write failed for delete");
        }

        QueueStore::enqueue_in_tx(
            &mut tx,
            table,
            record_id,
            ChangeAction::Delete,
            serde_json::json!({}),
            old.remote_updated_at,
        )
        .await?;

        leave_audit_scope(&mut tx).await?;
        tx.commit().await?;
        self.publish_status().await;
        Ok(())
    }

    /// Apply a remote row image locally without enqueueing.
    ///
    /// Used by the pull phase and by realtime events. The audit entry is
    /// attributed to `system`.
    pub async fn apply_remote(
        &self,
        table: &str,
        record_id: &str,
        payload: serde_json::Value,
        remote_updated_at: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let site_id = payload
            .get("site_id")
            .and_then(|v| v.as_str())
            .map(String::from);

        let mut tx = self.pool.begin().await?;
        enter_audit_scope(&mut tx).await?;

        let old = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let payload_text = serde_json::to_string(&payload)?;
        sqlx::query(
            r#"
            INSERT INTO records (table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(table_name, record_id) DO UPDATE SET
                payload = excluded.payload,
                site_id = excluded.site_id,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by,
                remote_updated_at = excluded.remote_updated_at
            "#,
        )
        .bind(table)
        .bind(record_id)
        .bind(&payload_text)
        .bind(&site_id)
        .bind(now)
        .bind(SYSTEM_ACTOR)
        .bind(remote_updated_at)
        .execute(&mut *tx)
        .await?;

        let action = if old.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Insert
        };
        let audit_entry = ChangeRecord::new(
            table,
            record_id,
            action,
            old.map(|r| r.payload),
            Some(payload),
            SYSTEM_ACTOR,
            site_id,
            now,
        )
        .with_description("applied from remote");
        if let Err(error) = AuditStore::record_in_tx(&mut tx, audit_entry).await {
            tracing::warn!(table, record_id, %error, "audit write failed for remote apply");
        }

        leave_audit_scope(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a row deleted on the remote. No-op when the row is already
    /// gone.
    pub async fn remove_remote(&self, table: &str, record_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        enter_audit_scope(&mut tx).await?;

        let old = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(old) = old else {
            leave_audit_scope(&mut tx).await?;
            tx.commit().await?;
            return Ok(());
        };

        sqlx::query(r#"DELETE FROM records WHERE table_name = ?1 AND record_id = ?2"#)
            .bind(table)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;

        let audit_entry = ChangeRecord::new(
            table,
            record_id,
            ChangeAction::Delete,
            Some(old.payload),
            None,
            SYSTEM_ACTOR,
            old.site_id,
            now,
        )
        .with_description("applied from remote");
        if let Err(error) = AuditStore::record_in_tx(&mut tx, audit_entry).await {
            tracing::warn!(table, record_id, %error, "audit write failed for remote delete");
        }

        leave_audit_scope(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a record.
    pub async fn get(&self, table: &str, record_id: &str) -> Result<Option<StoredRecord>> {
        let record = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// All records in a table.
    pub async fn list(&self, table: &str) -> Result<Vec<StoredRecord>> {
        let records = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT table_name, record_id, payload, site_id, updated_at, updated_by, remote_updated_at
            FROM records
            WHERE table_name = ?1
            ORDER BY record_id ASC
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Record the remote acknowledgement timestamp after a successful
    /// push, so later mutations know the base they were made against.
    pub async fn confirm_remote(
        &self,
        table: &str,
        record_id: &str,
        remote_updated_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records SET remote_updated_at = ?1
            WHERE table_name = ?2 AND record_id = ?3
            "#,
        )
        .bind(remote_updated_at)
        .bind(table)
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
