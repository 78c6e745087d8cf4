//! Remote backend access.
//!
//! The sync engine and auth bridge talk to the backend through the
//! [`RemoteStore`] trait; [`HttpRemote`] is the production implementation
//! and tests substitute an in-memory one.

mod http;

pub use http::HttpRemote;

use async_trait::async_trait;
use satchel_engine::SchemaVersion;
use serde::{Deserialize, Serialize};

/// Errors from the remote backend.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote is not configured")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected: {message}")]
    AuthRejected { message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Transport failures and server-side errors are transient; rejected
    /// requests and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) => true,
            RemoteError::Api { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        RemoteError::Transport(error.to_string())
    }
}

/// A row image as the remote stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub record_id: String,
    pub payload: serde_json::Value,
    /// Remote `updated_at` (epoch millis)
    pub updated_at: Option<i64>,
}

/// Identity attributes returned by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAuthUser {
    pub id: String,
    pub username: String,
    pub name: String,
    pub is_admin: bool,
}

/// Capability tokens for a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry (epoch seconds), when the backend reports one
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// A successful identity exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthExchange {
    pub user: RemoteAuthUser,
    pub session: SessionTokens,
}

/// Operations the sync subsystem needs from the backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert-or-update a row, tagging it with this client's identifier.
    /// Returns the acknowledged row image.
    async fn upsert_row(
        &self,
        table: &str,
        record_id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteRow, RemoteError>;

    /// Delete a row.
    async fn delete_row(&self, table: &str, record_id: &str) -> Result<(), RemoteError>;

    /// Fetch a single row, `None` when it does not exist.
    async fn fetch_row(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<RemoteRow>, RemoteError>;

    /// Rows changed since the watermark, optionally scoped to a site,
    /// ordered by remote `updated_at` ascending.
    async fn changed_since(
        &self,
        table: &str,
        since: Option<i64>,
        site_id: Option<&str>,
    ) -> Result<Vec<RemoteRow>, RemoteError>;

    /// The backend's published schema version row, `None` on legacy
    /// backends that do not publish one.
    async fn schema_version(&self) -> Result<Option<SchemaVersion>, RemoteError>;

    /// Token-based sign in.
    async fn sign_in(&self, username: &str, password: &str)
        -> Result<AuthExchange, RemoteError>;

    /// One-time legacy-account provisioning: the backend verifies the
    /// secret against the legacy hash, creates the token-based identity
    /// if needed, and returns a session. Idempotent for already-migrated
    /// accounts.
    async fn provision_legacy(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError>;
}
