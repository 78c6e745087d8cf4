//! Error types for the Satchel engine.

use thiserror::Error;

/// All possible errors from the Satchel engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Parsing errors for persisted wire strings
    #[error("unknown change action: {0}")]
    UnknownAction(String),

    #[error("unknown queue status: {0}")]
    UnknownStatus(String),

    #[error("unknown sync mode: {0}")]
    UnknownSyncMode(String),

    // Payload errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
