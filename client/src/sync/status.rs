//! Aggregate sync status publication.
//!
//! Only the sync subsystem writes status; the UI observes snapshots
//! through a watch channel. Every publication is a freshly recomputed,
//! internally consistent snapshot — observers never see queue counts from
//! one moment paired with flags from another.

use std::sync::Mutex;

use chrono::Utc;
use satchel_engine::{LastSyncInfo, SyncMode, SyncStatus};
use tokio::sync::watch;

use crate::db::{keys, MetaStore, QueueStore};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Flags {
    is_online: bool,
    is_syncing: bool,
    mode: SyncMode,
}

/// Owns the current [`SyncStatus`] snapshot.
pub struct SyncStatusManager {
    queue: QueueStore,
    meta: MetaStore,
    flags: Mutex<Flags>,
    tx: watch::Sender<SyncStatus>,
}

impl SyncStatusManager {
    pub fn new(queue: QueueStore, meta: MetaStore) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self {
            queue,
            meta,
            flags: Mutex::new(Flags {
                is_online: false,
                is_syncing: false,
                mode: SyncMode::default(),
            }),
            tx,
        }
    }

    /// Restore the persisted sync mode at startup.
    pub async fn load(&self) -> Result<()> {
        if let Some(raw) = self.meta.get(keys::SYNC_MODE).await? {
            if let Ok(mode) = raw.parse::<SyncMode>() {
                self.flags.lock().expect("status flags lock poisoned").mode = mode;
            }
        }
        self.refresh().await?;
        Ok(())
    }

    /// Subscribe to status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// The latest published snapshot.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Update connectivity and republish.
    pub async fn set_online(&self, is_online: bool) -> Result<()> {
        self.flags
            .lock()
            .expect("status flags lock poisoned")
            .is_online = is_online;
        self.refresh().await?;
        Ok(())
    }

    /// Update the syncing flag and republish.
    pub async fn set_syncing(&self, is_syncing: bool) -> Result<()> {
        self.flags
            .lock()
            .expect("status flags lock poisoned")
            .is_syncing = is_syncing;
        self.refresh().await?;
        Ok(())
    }

    /// Change the sync mode, persisting it across restarts.
    pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        self.meta.set(keys::SYNC_MODE, mode.as_str()).await?;
        self.flags.lock().expect("status flags lock poisoned").mode = mode;
        self.refresh().await?;
        Ok(())
    }

    /// Record a successful sync pass.
    pub async fn record_success(&self) -> Result<()> {
        let info = LastSyncInfo::success(Utc::now().timestamp_millis());
        self.meta.set_json(keys::LAST_SYNC_INFO, &info).await?;
        self.refresh().await?;
        Ok(())
    }

    /// Record a failed sync pass.
    pub async fn record_failure(&self, error: &str) -> Result<()> {
        let info = LastSyncInfo::failure(Utc::now().timestamp_millis(), error);
        self.meta.set_json(keys::LAST_SYNC_INFO, &info).await?;
        self.refresh().await?;
        Ok(())
    }

    /// Recompute the snapshot from queue counts, connectivity, and the
    /// persisted last-sync info, then publish it.
    pub async fn refresh(&self) -> Result<SyncStatus> {
        let pending_count = self.queue.pending_count().await?;
        let conflict_count = self.queue.conflict_count().await?;
        let last_sync: LastSyncInfo = self
            .meta
            .get_json(keys::LAST_SYNC_INFO)
            .await?
            .unwrap_or_default();

        // Counts are gathered before the lock; the lock itself is held
        // only to read the flags, never across an await.
        let flags = *self.flags.lock().expect("status flags lock poisoned");

        let status = SyncStatus {
            pending_count,
            conflict_count,
            is_online: flags.is_online,
            is_syncing: flags.is_syncing,
            sync_mode: flags.mode,
            last_sync,
        };
        self.tx.send_replace(status.clone());
        Ok(status)
    }
}
