//! Satchel client - offline-first synchronization over local SQLite.
//!
//! The runtime half of Satchel: durable storage for records, audit trail,
//! and the mutation queue; the sync engine and its background worker; the
//! remote store abstraction; the session compatibility gate; and the
//! auth/session bridge. The deterministic policies all live in
//! `satchel-engine` — this crate supplies the IO around them.
//!
//! Services are constructed once at process start and passed by handle;
//! there is no ambient global state. See `main.rs` for the composition
//! root.

pub mod auth;
pub mod compat;
pub mod config;
pub mod db;
pub mod error;
pub mod remote;
pub mod sync;

pub use auth::{AuthBridge, AuthOutcome};
pub use compat::CompatibilityGate;
pub use config::{Config, ConfigError, RemoteConfig};
pub use db::{
    AuditStore, LocalStore, LocalUser, MetaStore, Pool, QueueStore, StoredRecord, UserStore,
};
pub use error::{ClientError, Result};
pub use remote::{HttpRemote, RemoteError, RemoteStore};
pub use sync::{RealtimeSync, SyncEngine, SyncHandle, SyncReport, SyncStatusManager, SyncTrigger};
