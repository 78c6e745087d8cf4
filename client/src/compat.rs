//! Session-start compatibility gate.
//!
//! Runs once at bootstrap, before any sync activity. The remote's
//! schema-version row is probed and compared against this build's
//! constants; the result gates every sync pass, mutation path, and login
//! for the rest of the session.
//!
//! Offline behavior: the last probed row is cached, and an
//! incompatibility detected while online latches a blocked minimum so
//! going offline does not unblock an app the backend already rejected.
//! A backend that publishes no version row, or a first run with no cache,
//! is allowed — fail-open for pre-versioning deployments.

use std::sync::{Arc, RwLock};

use satchel_engine::{check_compatibility, Compatibility, SchemaVersion, APP_SCHEMA_VERSION};

use crate::db::{keys, MetaStore};
use crate::error::{ClientError, Result};
use crate::remote::RemoteStore;

/// The gate guarding this session.
pub struct CompatibilityGate {
    remote: Option<Arc<dyn RemoteStore>>,
    meta: MetaStore,
    state: RwLock<Compatibility>,
}

impl CompatibilityGate {
    pub fn new(remote: Option<Arc<dyn RemoteStore>>, meta: MetaStore) -> Self {
        Self {
            remote,
            meta,
            state: RwLock::new(Compatibility::Compatible),
        }
    }

    /// Probe the remote and settle this session's verdict.
    pub async fn check_at_startup(&self) -> Result<Compatibility> {
        let result = self.evaluate().await?;

        match &result {
            Compatibility::Compatible => {
                tracing::info!(app_schema_version = APP_SCHEMA_VERSION, "compatibility check passed");
            }
            other => {
                tracing::error!(verdict = %other.describe(), "compatibility check failed, session blocked");
            }
        }

        *self.state.write().expect("gate state lock poisoned") = result.clone();
        Ok(result)
    }

    async fn evaluate(&self) -> Result<Compatibility> {
        let Some(remote) = &self.remote else {
            // Local-only deployment; nothing to be incompatible with.
            return Ok(Compatibility::Compatible);
        };

        match remote.schema_version().await {
            Ok(row) => {
                if let Some(row) = &row {
                    self.meta
                        .set_json(keys::CACHED_SCHEMA_VERSION, row)
                        .await?;
                }
                let result = check_compatibility(row.as_ref());
                match &result {
                    Compatibility::AppTooOld { min_required, .. } => {
                        self.meta
                            .set(keys::BLOCKED_MIN_APP_VERSION, &min_required.to_string())
                            .await?;
                    }
                    _ => {
                        self.meta.delete(keys::BLOCKED_MIN_APP_VERSION).await?;
                    }
                }
                Ok(result)
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(%error, "compatibility probe unreachable, using cached verdict");
                self.offline_verdict().await
            }
            Err(error) => Ok(Compatibility::Unknown {
                reason: error.to_string(),
            }),
        }
    }

    /// The verdict when the backend cannot be reached.
    async fn offline_verdict(&self) -> Result<Compatibility> {
        if let Some(blocked) = self.meta.get(keys::BLOCKED_MIN_APP_VERSION).await? {
            if let Ok(min_required) = blocked.parse::<i32>() {
                if APP_SCHEMA_VERSION < min_required {
                    let cached: Option<SchemaVersion> =
                        self.meta.get_json(keys::CACHED_SCHEMA_VERSION).await?;
                    return Ok(Compatibility::AppTooOld {
                        app_version: APP_SCHEMA_VERSION,
                        min_required,
                        db_version: cached.map(|c| c.schema_version).unwrap_or(0),
                    });
                }
            }
        }

        let cached: Option<SchemaVersion> =
            self.meta.get_json(keys::CACHED_SCHEMA_VERSION).await?;
        Ok(check_compatibility(cached.as_ref()))
    }

    /// The session's current verdict.
    pub fn current(&self) -> Compatibility {
        self.state.read().expect("gate state lock poisoned").clone()
    }

    /// Error out unless this session is allowed to operate.
    ///
    /// `Unknown` does not block: a verdict we could not compute is not an
    /// incompatibility.
    pub fn ensure_allowed(&self) -> Result<()> {
        let state = self.current();
        match state {
            Compatibility::AppTooOld { .. } | Compatibility::DbTooOld { .. } => {
                Err(ClientError::Blocked(state))
            }
            _ => Ok(()),
        }
    }
}
