//! Local credential records.
//!
//! The local user row is the source of truth for authorization; the
//! remote session is a capability token refreshed independently. The
//! sentinel offline admin is identified by the marker in `created_by`.

use sqlx::{Row, SqlitePool};

use crate::error::Result;

/// Marker identifying the auto-created local admin.
pub const LOCAL_SYSTEM_MARKER: &str = "LOCAL_SYSTEM_ADMIN";

/// Remote table holding identity rows; the pull phase routes it into the
/// user store instead of the generic records table.
pub const USERS_TABLE: &str = "app_users";

/// A local user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl LocalUser {
    /// Whether this is the sentinel offline admin.
    pub fn is_local_system(&self) -> bool {
        self.created_by.as_deref() == Some(LOCAL_SYSTEM_MARKER)
    }

    /// Map a remote row image onto a local user record.
    ///
    /// Remote rows carry no usable secret; the password hash is left
    /// empty, so offline verification stays impossible until the user
    /// authenticates online once.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let id = payload.get("id")?.as_str()?.to_string();
        let username = payload.get("username")?.as_str()?.to_string();

        let text = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
        };
        let flag = |key: &str, default: bool| {
            payload.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
        };
        let stamp = |key: &str| payload.get(key).and_then(|v| v.as_i64()).unwrap_or(0);

        Some(LocalUser {
            id,
            username,
            password_hash: text("password_hash").unwrap_or_default(),
            full_name: text("full_name").unwrap_or_default(),
            is_admin: flag("is_admin", false),
            is_active: flag("is_active", true),
            created_at: stamp("created_at"),
            updated_at: stamp("updated_at"),
            created_by: text("created_by"),
            updated_by: text("updated_by"),
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for LocalUser {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(LocalUser {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            full_name: row.try_get("full_name")?,
            is_admin: row.try_get::<i64, _>("is_admin")? != 0,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            created_by: row.try_get("created_by")?,
            updated_by: row.try_get("updated_by")?,
        })
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, full_name, is_admin, is_active, \
                            created_at, updated_at, created_by, updated_by";

/// Store for local user records.
#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a user.
    pub async fn upsert(&self, user: &LocalUser) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_users (
                id, username, password_hash, full_name, is_admin, is_active,
                created_at, updated_at, created_by, updated_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                password_hash = excluded.password_hash,
                full_name = excluded.full_name,
                is_admin = excluded.is_admin,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.full_name)
        .bind(user.is_admin as i64)
        .bind(user.is_active as i64)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(&user.created_by)
        .bind(&user.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find a user by username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<LocalUser>> {
        let user = sqlx::query_as::<_, LocalUser>(&format!(
            r#"SELECT {USER_COLUMNS} FROM app_users WHERE username = ?1"#
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// All users.
    pub async fn get_all(&self) -> Result<Vec<LocalUser>> {
        let users = sqlx::query_as::<_, LocalUser>(&format!(
            r#"SELECT {USER_COLUMNS} FROM app_users ORDER BY username ASC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Number of users.
    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM app_users"#)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// Delete a user by id.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM app_users WHERE id = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
