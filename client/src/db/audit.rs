//! Audit log persistence and the storage-level trigger backstop.
//!
//! Two layers guarantee that every mutation of the records table leaves a
//! change record:
//!
//! 1. the repository path writes its audit entry inside the same
//!    transaction as the mutation, with full actor context;
//! 2. SQLite triggers mirror any mutation that arrives outside that path
//!    (direct low-level writes), attributing it from the row itself.
//!
//! The two layers are kept from double-logging by the `audit_scope`
//! marker table: the repository path inserts a marker at the start of its
//! transaction and removes it before commit, and the triggers fire only
//! while the table is empty. SQLite serializes write transactions, so a
//! marker is only ever visible to the transaction that planted it.

use satchel_engine::{ChangeAction, ChangeRecord};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

use crate::error::Result;

/// Description stamped on entries produced by the trigger backstop.
const TRIGGER_DESCRIPTION: &str = "storage trigger audit";

/// Store for the immutable audit trail.
#[derive(Debug, Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

/// Raw audit row, mapped manually from SQLite.
struct AuditRow {
    id: i64,
    entity_type: String,
    entity_id: String,
    action_type: String,
    old_value: Option<String>,
    new_value: Option<String>,
    changed_by: String,
    site_id: Option<String>,
    description: Option<String>,
    changed_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for AuditRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(AuditRow {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            action_type: row.try_get("action_type")?,
            old_value: row.try_get("old_value")?,
            new_value: row.try_get("new_value")?,
            changed_by: row.try_get("changed_by")?,
            site_id: row.try_get("site_id")?,
            description: row.try_get("description")?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

impl AuditRow {
    fn into_record(self) -> Result<ChangeRecord> {
        let action = ChangeAction::from_str(&self.action_type)?;
        let old_values = self
            .old_value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let new_values = self
            .new_value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let mut record = ChangeRecord::new(
            self.entity_type,
            self.entity_id,
            action,
            old_values,
            new_values,
            self.changed_by,
            self.site_id,
            self.changed_at,
        );
        record.id = self.id;
        record.description = self.description;
        Ok(record)
    }
}

impl AuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a change record through the application path.
    ///
    /// Returns the persisted record with its storage-assigned id.
    pub async fn record(&self, record: ChangeRecord) -> Result<ChangeRecord> {
        let mut tx = self.pool.begin().await?;
        let persisted = Self::record_in_tx(&mut tx, record).await?;
        tx.commit().await?;
        Ok(persisted)
    }

    /// Append a change record inside an existing transaction.
    pub async fn record_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        mut record: ChangeRecord,
    ) -> Result<ChangeRecord> {
        let old_value = record
            .old_values
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new_value = record
            .new_values
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (
                entity_type, entity_id, action_type, field_name,
                old_value, new_value, changed_by, site_id, description, changed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.table_name)
        .bind(&record.record_id)
        .bind(record.action.as_str())
        .bind(satchel_engine::ALL_FIELDS)
        .bind(&old_value)
        .bind(&new_value)
        .bind(&record.actor)
        .bind(&record.site_id)
        .bind(&record.description)
        .bind(record.changed_at)
        .execute(&mut **tx)
        .await?;

        record.id = result.last_insert_rowid();
        Ok(record)
    }

    /// Change history for one record, newest first.
    pub async fn list_for_record(&self, table: &str, record_id: &str) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, entity_type, entity_id, action_type, field_name,
                   old_value, new_value, changed_by, site_id, description, changed_at
            FROM audit_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY changed_at DESC, id DESC
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_record).collect()
    }

    /// Total number of audit entries.
    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM audit_log"#)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// Retention sweep: drop entries older than the cutoff (epoch millis).
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM audit_log WHERE changed_at < ?1"#)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Install the trigger backstop on the records table.
    ///
    /// Idempotent; run at every startup after migrations, the same way
    /// the schema itself is ensured.
    pub async fn install_triggers(&self) -> Result<()> {
        for statement in [
            build_insert_trigger(),
            build_update_trigger(),
            build_delete_trigger(),
        ] {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        tracing::debug!("audit triggers installed");
        Ok(())
    }
}

fn changed_by_expr(alias: &str) -> String {
    format!("COALESCE({alias}.updated_by, json_extract({alias}.payload, '$.updated_by'), 'system')")
}

fn build_insert_trigger() -> String {
    format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS audit_records_insert
        AFTER INSERT ON records
        WHEN (SELECT COUNT(*) FROM audit_scope) = 0
        BEGIN
            INSERT INTO audit_log (entity_type, entity_id, action_type, field_name, old_value, new_value, changed_by, site_id, description, changed_at)
            VALUES (
                NEW.table_name,
                NEW.record_id,
                'INSERT',
                'ALL_FIELDS',
                NULL,
                NEW.payload,
                {changed_by},
                NEW.site_id,
                '{description}',
                (strftime('%s','now') * 1000)
            );
        END;
        "#,
        changed_by = changed_by_expr("NEW"),
        description = TRIGGER_DESCRIPTION,
    )
}

fn build_update_trigger() -> String {
    format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS audit_records_update
        AFTER UPDATE ON records
        WHEN (SELECT COUNT(*) FROM audit_scope) = 0
        BEGIN
            INSERT INTO audit_log (entity_type, entity_id, action_type, field_name, old_value, new_value, changed_by, site_id, description, changed_at)
            VALUES (
                NEW.table_name,
                NEW.record_id,
                'UPDATE',
                'ALL_FIELDS',
                OLD.payload,
                NEW.payload,
                {changed_by},
                NEW.site_id,
                '{description}',
                (strftime('%s','now') * 1000)
            );
        END;
        "#,
        changed_by = changed_by_expr("NEW"),
        description = TRIGGER_DESCRIPTION,
    )
}

fn build_delete_trigger() -> String {
    format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS audit_records_delete
        AFTER DELETE ON records
        WHEN (SELECT COUNT(*) FROM audit_scope) = 0
        BEGIN
            INSERT INTO audit_log (entity_type, entity_id, action_type, field_name, old_value, new_value, changed_by, site_id, description, changed_at)
            VALUES (
                OLD.table_name,
                OLD.record_id,
                'DELETE',
                'ALL_FIELDS',
                OLD.payload,
                NULL,
                {changed_by},
                OLD.site_id,
                '{description}',
                (strftime('%s','now') * 1000)
            );
        END;
        "#,
        changed_by = changed_by_expr("OLD"),
        description = TRIGGER_DESCRIPTION,
    )
}

/// Plant the marker that suppresses the trigger backstop for the duration
/// of a repository-path transaction.
pub(crate) async fn enter_audit_scope(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query(r#"INSERT INTO audit_scope (marker) VALUES (1)"#)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Remove the marker before commit.
pub(crate) async fn leave_audit_scope(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query(r#"DELETE FROM audit_scope"#)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
