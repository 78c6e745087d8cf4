//! Realtime change application.
//!
//! Row-change notifications pushed by the remote are applied through the
//! engine's echo filter: our own writes come back tagged with this
//! client's identifier and are dropped; everything else is applied with
//! the same server-wins discipline as the pull phase. The transport
//! delivering the events is the caller's concern.

use std::sync::Arc;

use satchel_engine::{ChangeEvent, ChangeEventKind, EchoFilter};

use crate::db::{LocalStore, QueueStore};
use crate::error::Result;
use crate::sync::SyncStatusManager;

/// Applies realtime events to local state.
pub struct RealtimeSync {
    filter: EchoFilter,
    records: LocalStore,
    queue: QueueStore,
    status: Arc<SyncStatusManager>,
}

impl RealtimeSync {
    pub fn new(
        filter: EchoFilter,
        records: LocalStore,
        queue: QueueStore,
        status: Arc<SyncStatusManager>,
    ) -> Self {
        Self {
            filter,
            records,
            queue,
            status,
        }
    }

    /// Apply one event. Returns whether it was applied (false for
    /// suppressed echoes).
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<bool> {
        if !self.filter.should_process(event) {
            tracing::debug!(
                table = %event.table_name,
                record_id = %event.record_id,
                "realtime echo suppressed"
            );
            return Ok(false);
        }

        // A still-pending local mutation for this record loses to the
        // incoming server state.
        let pending = self
            .queue
            .pending_for(&event.table_name, &event.record_id)
            .await?;

        match event.kind {
            ChangeEventKind::Insert | ChangeEventKind::Update => {
                self.records
                    .apply_remote(
                        &event.table_name,
                        &event.record_id,
                        event.row.clone(),
                        event.updated_at,
                    )
                    .await?;
            }
            ChangeEventKind::Delete => {
                self.records
                    .remove_remote(&event.table_name, &event.record_id)
                    .await?;
            }
        }

        if let Some(pending) = pending {
            self.queue
                .mark_conflict(&pending.id, "record changed on the server since this mutation")
                .await?;
            tracing::warn!(
                table = %event.table_name,
                record_id = %event.record_id,
                "realtime change overrode pending local mutation"
            );
            self.status.refresh().await?;
        }

        Ok(true)
    }
}
