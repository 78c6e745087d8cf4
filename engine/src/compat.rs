//! App/backend schema compatibility gate.
//!
//! Run once per session bootstrap, before any sync activity. Two
//! independent one-directional checks must both pass: the app must be new
//! enough for the backend, and the backend must be new enough for the
//! app. Either failing direction blocks sync, mutation, and login for the
//! whole session.
//!
//! A backend without version information (legacy, pre-versioning) is
//! treated as compatible. That fail-open default is deliberate: it keeps
//! old deployments working, and an incompatibility can only ever be
//! declared by a backend that actually publishes versions.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Schema version this build of the app speaks.
///
/// Increment when a migration changes the schema in a way older app
/// versions cannot handle.
///
/// History:
/// - 1: initial schema
/// - 2: migration system and versioning
pub const APP_SCHEMA_VERSION: i32 = 2;

/// Oldest backend schema version this build can still read.
pub const MIN_SCHEMA_VERSION: i32 = 1;

/// The version row the backend publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Backend schema version
    pub schema_version: i32,
    /// Minimum app schema version the backend accepts
    pub min_app_version: i32,
    /// When the row was last updated (epoch millis)
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// Result of the compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Compatibility {
    /// Both directions pass; the session may proceed.
    Compatible,
    /// The app is older than the backend requires — update the app.
    AppTooOld {
        app_version: i32,
        min_required: i32,
        db_version: i32,
    },
    /// The backend is older than the app requires — wait for the backend
    /// migration.
    DbTooOld {
        db_version: i32,
        min_required: i32,
        app_version: i32,
    },
    /// The check could not be performed.
    Unknown { reason: String },
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }

    /// True when resolving requires updating the app.
    pub fn requires_app_update(&self) -> bool {
        matches!(self, Compatibility::AppTooOld { .. })
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Compatibility::Compatible => {
                format!("compatible (app schema version {APP_SCHEMA_VERSION})")
            }
            Compatibility::AppTooOld {
                app_version,
                min_required,
                db_version,
            } => format!(
                "app too old: version {app_version}, minimum required {min_required}, backend schema {db_version}"
            ),
            Compatibility::DbTooOld {
                db_version,
                min_required,
                app_version,
            } => format!(
                "backend too old: schema {db_version}, minimum required {min_required}, app version {app_version}"
            ),
            Compatibility::Unknown { reason } => format!("compatibility unknown: {reason}"),
        }
    }
}

/// Check this build against the backend-declared version row.
///
/// `None` means the backend does not publish versions and is treated as
/// compatible (see module docs).
pub fn check_compatibility(remote: Option<&SchemaVersion>) -> Compatibility {
    check_versions(APP_SCHEMA_VERSION, MIN_SCHEMA_VERSION, remote)
}

/// The check with explicit local constants, for tests and callers that
/// embed different versions.
pub fn check_versions(
    app_version: i32,
    min_schema_version: i32,
    remote: Option<&SchemaVersion>,
) -> Compatibility {
    let Some(remote) = remote else {
        return Compatibility::Compatible;
    };

    if app_version < remote.min_app_version {
        return Compatibility::AppTooOld {
            app_version,
            min_required: remote.min_app_version,
            db_version: remote.schema_version,
        };
    }

    if remote.schema_version < min_schema_version {
        return Compatibility::DbTooOld {
            db_version: remote.schema_version,
            min_required: min_schema_version,
            app_version,
        };
    }

    Compatibility::Compatible
}
