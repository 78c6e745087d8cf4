//! Unified error handling for the client.

use satchel_engine::Compatibility;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] satchel_engine::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session blocked: {}", .0.describe())]
    Blocked(Compatibility),

    #[error("Record not found: {table}/{id}")]
    RecordNotFound { table: String, id: String },

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Remote(e) => e.is_transient(),
            ClientError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
