//! Key/value meta store and per-table pull cursors.
//!
//! Holds the small durable state that is not entity data: last sync
//! outcome, cached remote schema version, the blocked-version latch,
//! this client's identifier, session tokens, and the configured sync
//! mode.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;

/// Well-known meta keys.
pub mod keys {
    pub const CLIENT_ID: &str = "client_id";
    pub const LAST_SYNC_INFO: &str = "last_sync_info";
    pub const CACHED_SCHEMA_VERSION: &str = "cached_schema_version";
    pub const BLOCKED_MIN_APP_VERSION: &str = "blocked_min_app_version";
    pub const SESSION: &str = "session";
    pub const SYNC_MODE: &str = "sync_mode";
}

/// Store for the meta table and sync cursors.
#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a raw value.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r#"SELECT value FROM meta WHERE key = ?1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    /// Set a raw value.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM meta WHERE key = ?1"#)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a JSON-encoded value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Set a JSON-encoded value.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?).await
    }

    /// This client's stable opaque identifier, generated on first use.
    pub async fn ensure_client_id(&self) -> Result<String> {
        if let Some(id) = self.get(keys::CLIENT_ID).await? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.set(keys::CLIENT_ID, &id).await?;
        tracing::info!(client_id = %id, "generated client identifier");
        Ok(id)
    }

    /// Pull watermark for a table.
    pub async fn cursor(&self, table: &str) -> Result<Option<i64>> {
        let row = sqlx::query(r#"SELECT last_pulled_at FROM sync_cursors WHERE table_name = ?1"#)
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("last_pulled_at")).transpose()?)
    }

    /// Advance a table's pull watermark.
    pub async fn set_cursor(&self, table: &str, last_pulled_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (table_name, last_pulled_at) VALUES (?1, ?2)
            ON CONFLICT(table_name) DO UPDATE SET last_pulled_at = excluded.last_pulled_at
            "#,
        )
        .bind(table)
        .bind(last_pulled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
