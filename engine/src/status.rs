//! Aggregate sync status and its indicator derivation.
//!
//! [`SyncStatus`] has no identity of its own: it is recomputed from queue
//! counts, connectivity, and the last sync attempt's outcome after every
//! queue mutation, connectivity change, or sync pass. Only the sync
//! engine produces it; observers read snapshots.

use crate::{Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How sync passes are initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Background sync on timer and connectivity events (default)
    #[default]
    Automatic,
    /// Sync only on explicit request
    Manual,
    /// No sync even while online
    OfflineForced,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Automatic => "AUTOMATIC",
            SyncMode::Manual => "MANUAL",
            SyncMode::OfflineForced => "OFFLINE_FORCED",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" => Ok(SyncMode::Automatic),
            "MANUAL" => Ok(SyncMode::Manual),
            "OFFLINE_FORCED" => Ok(SyncMode::OfflineForced),
            other => Err(Error::UnknownSyncMode(other.to_string())),
        }
    }
}

/// Outcome of the most recent sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LastSyncInfo {
    /// When the attempt finished (None if the client has never synced)
    pub timestamp: Option<Timestamp>,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Error message when it did not
    pub error: Option<String>,
}

impl LastSyncInfo {
    /// A successful attempt at `timestamp`.
    pub fn success(timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
            success: true,
            error: None,
        }
    }

    /// A failed attempt at `timestamp`.
    pub fn failure(timestamp: Timestamp, error: impl Into<String>) -> Self {
        Self {
            timestamp: Some(timestamp),
            success: false,
            error: Some(error.into()),
        }
    }

    /// Whether the client has ever completed a sync attempt.
    pub fn has_ever_synced(&self) -> bool {
        self.timestamp.is_some()
    }
}

/// User-facing indicator derived from [`SyncStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorColor {
    /// Everything acknowledged by the remote
    Synced,
    /// Local mutations waiting to be pushed
    Pending,
    /// A sync pass is running
    Syncing,
    /// No connectivity
    Offline,
    /// Conflicts to resolve, or the last sync failed
    Error,
}

/// Process-wide sync snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Entries waiting to be pushed (pending + retrying)
    pub pending_count: u64,
    /// Entries requiring manual resolution
    pub conflict_count: u64,
    /// Current connectivity
    pub is_online: bool,
    /// Whether a sync pass is running right now
    pub is_syncing: bool,
    /// Current sync mode
    pub sync_mode: SyncMode,
    /// Outcome of the last attempt
    pub last_sync: LastSyncInfo,
}

impl SyncStatus {
    /// Nothing pending, nothing conflicted, nothing running.
    pub fn is_fully_synced(&self) -> bool {
        self.pending_count == 0 && self.conflict_count == 0 && !self.is_syncing
    }

    /// Something needs the user's attention: unresolved conflicts, or a
    /// failed last attempt.
    pub fn has_issues(&self) -> bool {
        self.conflict_count > 0 || (!self.last_sync.success && self.last_sync.has_ever_synced())
    }

    /// Indicator precedence: error > offline > syncing > pending > synced.
    pub fn indicator(&self) -> IndicatorColor {
        match self {
            s if s.has_issues() => IndicatorColor::Error,
            s if !s.is_online => IndicatorColor::Offline,
            s if s.is_syncing => IndicatorColor::Syncing,
            s if s.pending_count > 0 => IndicatorColor::Pending,
            _ => IndicatorColor::Synced,
        }
    }

    /// One-line human summary for display surfaces.
    pub fn summary(&self) -> String {
        match self.indicator() {
            IndicatorColor::Error if self.conflict_count > 0 => {
                format!("{} conflict(s) to resolve", self.conflict_count)
            }
            IndicatorColor::Error => match &self.last_sync.error {
                Some(error) => format!("last sync failed: {error}"),
                None => "last sync failed".to_string(),
            },
            IndicatorColor::Offline => "offline".to_string(),
            IndicatorColor::Syncing => "syncing...".to_string(),
            IndicatorColor::Pending => format!("{} change(s) pending", self.pending_count),
            IndicatorColor::Synced => "synced".to_string(),
        }
    }
}
