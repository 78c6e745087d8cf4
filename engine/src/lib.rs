//! # Satchel Engine
//!
//! The deterministic core of Satchel's offline-first synchronization.
//!
//! This crate holds every sync decision that can be made without touching
//! the network, the filesystem, or a clock: how queued mutations for the
//! same record collapse into one, how a sync conflict is resolved, how the
//! aggregate sync status maps to a user-facing indicator, whether a client
//! and a backend schema are compatible, and whether a realtime change
//! notification is an echo of this client's own write.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of SQLite, HTTP, or platform
//! - **Deterministic**: same inputs always produce the same outputs;
//!   timestamps are passed in, never read
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Change records
//!
//! Every local mutation produces a [`ChangeRecord`]: an immutable audit
//! entry carrying full JSON snapshots of the old and new entity state.
//! Snapshots, not field diffs — simplicity over storage efficiency.
//!
//! ### Queued operations
//!
//! Mutations made while offline become [`QueuedOperation`]s. The
//! [`coalesce`] function decides how a new mutation folds into an
//! existing pending entry so that at most one non-terminal entry exists
//! per (table, record) pair, always carrying the latest payload.
//!
//! ### Server wins
//!
//! When a record was modified both locally (still pending) and remotely,
//! the remote version overwrites local state and the pending entry is
//! surfaced as a conflict rather than silently dropped.
//!
//! ### Status derivation
//!
//! [`SyncStatus`] is a recomputed snapshot, never persisted. Its
//! [`IndicatorColor`] follows a fixed precedence:
//! error > offline > syncing > pending > synced.
//!
//! ## Quick Start
//!
//! ```rust
//! use satchel_engine::{coalesce, ChangeAction, CoalesceDecision, QueuedOperation};
//! use serde_json::json;
//!
//! // First mutation for a record: append a queue entry.
//! assert_eq!(coalesce(None, ChangeAction::Insert), CoalesceDecision::Append);
//!
//! // A delete arriving before the insert ever synced cancels both.
//! let pending = QueuedOperation::new(
//!     "q-1",
//!     "products",
//!     "prod-1",
//!     ChangeAction::Insert,
//!     json!({"name": "Paracetamol"}),
//!     1706745600000,
//! );
//! assert_eq!(
//!     coalesce(Some(&pending), ChangeAction::Delete),
//!     CoalesceDecision::Cancel
//! );
//! ```

pub mod change;
pub mod compat;
pub mod error;
pub mod queue;
pub mod realtime;
pub mod retry;
pub mod status;

// Re-export main types at crate root
pub use change::{ChangeAction, ChangeRecord, ALL_FIELDS, SYSTEM_ACTOR};
pub use compat::{
    check_compatibility, check_versions, Compatibility, SchemaVersion, APP_SCHEMA_VERSION,
    MIN_SCHEMA_VERSION,
};
pub use error::Error;
pub use queue::{coalesce, CoalesceDecision, QueueStatus, QueuedOperation};
pub use realtime::{ChangeEvent, ChangeEventKind, EchoFilter, CLIENT_ID_FIELD};
pub use retry::RetryPolicy;
pub use status::{IndicatorColor, LastSyncInfo, SyncMode, SyncStatus};

/// Type aliases for clarity
pub type TableName = String;
pub type RecordId = String;
pub type ActorId = String;
pub type SiteId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;
