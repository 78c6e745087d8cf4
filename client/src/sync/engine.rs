//! The synchronization pass.
//!
//! One pass = push phase (drain the queue FIFO, one operation in flight
//! at a time) then pull phase (per-table changed-since queries scoped to
//! the active site), then a status publish. A failing operation is
//! contained to itself; a transport failure aborts the pass, leaving the
//! queue in a state any later pass recovers from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use satchel_engine::{ChangeAction, QueuedOperation, RetryPolicy};

use crate::auth::AuthBridge;
use crate::compat::CompatibilityGate;
use crate::db::{LocalStore, LocalUser, MetaStore, QueueStore, UserStore, USERS_TABLE};
use crate::error::{ClientError, Result};
use crate::remote::{RemoteRow, RemoteStore};
use crate::sync::SyncStatusManager;

/// What initiated a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Periodic timer
    Timer,
    /// Connectivity was regained
    Connectivity,
    /// Explicit user request
    Manual,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Operations acknowledged by the remote
    pub pushed: u64,
    /// Operations that failed and will retry
    pub failed: u64,
    /// Operations discarded by server-wins resolution
    pub conflicts: u64,
    /// Rows applied from the remote
    pub pulled: u64,
    /// The pass had nothing to do and made no remote calls
    pub skipped: bool,
}

enum PushOutcome {
    Synced { remote_updated_at: Option<i64> },
    Conflict { remote: Option<RemoteRow> },
}

/// Drives push, pull, and conflict resolution against the remote.
pub struct SyncEngine {
    records: LocalStore,
    queue: QueueStore,
    users: UserStore,
    meta: MetaStore,
    remote: Arc<dyn RemoteStore>,
    status: Arc<SyncStatusManager>,
    gate: Arc<CompatibilityGate>,
    auth: Arc<AuthBridge>,
    policy: RetryPolicy,
    /// Tables the pull phase covers, in dependency order
    tables: Vec<String>,
    site_id: Option<String>,
    client_id: String,
    /// Pull freshness window: a timer-triggered pass with a younger pull
    /// watermark skips the pull phase entirely
    min_pull_interval_ms: i64,
    cancelled: Arc<AtomicBool>,
}

const LAST_PULL_AT_KEY: &str = "last_pull_at";

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: LocalStore,
        queue: QueueStore,
        users: UserStore,
        meta: MetaStore,
        remote: Arc<dyn RemoteStore>,
        status: Arc<SyncStatusManager>,
        gate: Arc<CompatibilityGate>,
        auth: Arc<AuthBridge>,
        tables: Vec<String>,
        site_id: Option<String>,
        client_id: String,
        min_pull_interval_ms: i64,
    ) -> Self {
        Self {
            records,
            queue,
            users,
            meta,
            remote,
            status,
            gate,
            auth,
            policy: RetryPolicy::default(),
            tables,
            site_id,
            client_id,
            min_pull_interval_ms,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with the scheduler for cooperative cancellation:
    /// in-flight operations complete, no new ones start.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Run one synchronization pass.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        self.gate.ensure_allowed()?;

        // Forced-offline mode suppresses automatic passes; an explicit
        // "sync now" still runs.
        if self.status.current().sync_mode == satchel_engine::SyncMode::OfflineForced
            && trigger != SyncTrigger::Manual
        {
            tracing::debug!(?trigger, "forced-offline mode, automatic pass suppressed");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        self.cancelled.store(false, Ordering::Relaxed);

        let now = Utc::now().timestamp_millis();
        self.queue.release_stranded().await?;
        self.queue.release_due_retries(now, &self.policy).await?;

        let pending = self.queue.pending_count().await?;
        if pending == 0 && !self.pull_due(trigger, now).await? {
            tracing::debug!(?trigger, "nothing pending and pull watermark fresh, pass skipped");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        self.status.set_syncing(true).await?;
        let result = self.run_pass(trigger).await;
        self.status.set_syncing(false).await?;

        match result {
            Ok(report) => {
                self.status.record_success().await?;
                tracing::info!(
                    pushed = report.pushed,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    pulled = report.pulled,
                    "sync pass completed"
                );
                Ok(report)
            }
            Err(error) => {
                // Already-acknowledged operations stay synced; the rest
                // remain pending for the next pass.
                self.queue.release_stranded().await?;
                self.status.record_failure(&error.to_string()).await?;
                tracing::warn!(%error, "sync pass aborted");
                Err(error)
            }
        }
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        // Push phase: FIFO, one operation in flight, per-operation
        // failure containment.
        while let Some(op) = self.queue.dequeue_next().await? {
            if self.is_cancelled() {
                tracing::info!("sync cancelled, releasing in-flight entry");
                self.queue.release_stranded().await?;
                return Ok(report);
            }

            match self.push_one(&op).await {
                Ok(PushOutcome::Synced { remote_updated_at }) => {
                    self.queue.mark_synced(&op.id).await?;
                    if let Some(updated_at) = remote_updated_at {
                        self.records
                            .confirm_remote(&op.table_name, &op.record_id, updated_at)
                            .await?;
                    }
                    report.pushed += 1;
                }
                Ok(PushOutcome::Conflict { remote }) => {
                    self.apply_server_wins(&op, remote).await?;
                    report.conflicts += 1;
                }
                Err(error) if error.is_transient() => {
                    self.queue
                        .mark_failed(&op.id, &error.to_string(), &self.policy)
                        .await?;
                    report.failed += 1;
                    tracing::warn!(
                        table = %op.table_name,
                        record_id = %op.record_id,
                        %error,
                        "push failed, will retry with backoff"
                    );
                }
                Err(error) => {
                    self.queue
                        .mark_failed(&op.id, &error.to_string(), &self.policy)
                        .await?;
                    report.failed += 1;
                    tracing::warn!(
                        table = %op.table_name,
                        record_id = %op.record_id,
                        %error,
                        "push rejected by remote"
                    );
                }
            }
            self.status.refresh().await?;
        }

        // Pull phase.
        let now = Utc::now().timestamp_millis();
        if report.pushed > 0 || self.pull_due(trigger, now).await? {
            self.pull(&mut report).await?;
            self.meta
                .set(LAST_PULL_AT_KEY, &now.to_string())
                .await?;
        }

        self.status.refresh().await?;
        Ok(report)
    }

    async fn pull_due(&self, trigger: SyncTrigger, now: i64) -> Result<bool> {
        if trigger == SyncTrigger::Manual {
            return Ok(true);
        }
        let last_pull = self
            .meta
            .get(LAST_PULL_AT_KEY)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok());
        Ok(match last_pull {
            Some(at) => now - at >= self.min_pull_interval_ms,
            None => true,
        })
    }

    /// Push one operation to the remote.
    ///
    /// Updates and deletes first compare the server's `updated_at` with
    /// the one this mutation was based on; a newer server row means the
    /// record changed remotely while our mutation waited, and the server
    /// wins. Inserts never conflict.
    async fn push_one(&self, op: &QueuedOperation) -> Result<PushOutcome> {
        match op.operation {
            ChangeAction::Insert => {
                let row = self
                    .remote
                    .upsert_row(&op.table_name, &op.record_id, &op.payload)
                    .await?;
                Ok(PushOutcome::Synced {
                    remote_updated_at: row.updated_at,
                })
            }
            ChangeAction::Update => {
                let current = self.remote.fetch_row(&op.table_name, &op.record_id).await?;
                if Self::is_conflict(op.last_known_remote_updated_at, current.as_ref()) {
                    return Ok(PushOutcome::Conflict { remote: current });
                }
                let row = self
                    .remote
                    .upsert_row(&op.table_name, &op.record_id, &op.payload)
                    .await?;
                Ok(PushOutcome::Synced {
                    remote_updated_at: row.updated_at,
                })
            }
            ChangeAction::Delete => {
                let current = self.remote.fetch_row(&op.table_name, &op.record_id).await?;
                if Self::is_conflict(op.last_known_remote_updated_at, current.as_ref()) {
                    return Ok(PushOutcome::Conflict { remote: current });
                }
                self.remote.delete_row(&op.table_name, &op.record_id).await?;
                Ok(PushOutcome::Synced {
                    remote_updated_at: None,
                })
            }
        }
    }

    fn is_conflict(last_known: Option<i64>, current: Option<&RemoteRow>) -> bool {
        match (last_known, current.and_then(|row| row.updated_at)) {
            (Some(known), Some(current)) => current > known,
            _ => false,
        }
    }

    /// Server-wins resolution: the remote row overwrites local state and
    /// the discarded entry surfaces as a conflict.
    async fn apply_server_wins(
        &self,
        op: &QueuedOperation,
        remote: Option<RemoteRow>,
    ) -> Result<()> {
        if let Some(row) = remote {
            self.records
                .apply_remote(&op.table_name, &op.record_id, row.payload, row.updated_at)
                .await?;
        } else {
            self.records
                .remove_remote(&op.table_name, &op.record_id)
                .await?;
        }
        self.queue
            .mark_conflict(&op.id, "record changed on the server since this mutation")
            .await?;
        tracing::warn!(
            table = %op.table_name,
            record_id = %op.record_id,
            "local change discarded, server version kept"
        );
        Ok(())
    }

    /// Pull remote changes per table from the stored watermarks.
    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        for table in &self.tables {
            if self.is_cancelled() {
                return Ok(());
            }

            let since = self.meta.cursor(table).await?;
            let rows = self
                .remote
                .changed_since(table, since, self.site_id.as_deref())
                .await?;
            if rows.is_empty() {
                continue;
            }

            let mut watermark = since.unwrap_or(0);
            let mut applied_users = false;
            for row in rows {
                if self.is_cancelled() {
                    break;
                }
                if let Some(updated_at) = row.updated_at {
                    watermark = watermark.max(updated_at);
                }

                // Our own acknowledged writes come back tagged with this
                // client's id; reapplying them would churn the audit log.
                let writer = row
                    .payload
                    .get(satchel_engine::CLIENT_ID_FIELD)
                    .and_then(|v| v.as_str());
                if writer == Some(self.client_id.as_str()) {
                    continue;
                }

                if table.as_str() == USERS_TABLE {
                    applied_users |= self.apply_user_row(&row).await?;
                } else {
                    self.apply_pulled_row(table, row, report).await?;
                }
                report.pulled += 1;
            }

            self.meta.set_cursor(table, watermark).await?;

            if applied_users {
                self.auth.remove_local_admin_if_remote_users_exist().await?;
            }
        }
        Ok(())
    }

    async fn apply_pulled_row(
        &self,
        table: &str,
        row: RemoteRow,
        report: &mut SyncReport,
    ) -> Result<()> {
        if row.record_id.is_empty() {
            return Err(ClientError::Internal(format!(
                "pulled row without id in table {table}"
            )));
        }

        // A still-pending local mutation for the same record loses to the
        // incoming remote state.
        if let Some(pending) = self.queue.pending_for(table, &row.record_id).await? {
            self.records
                .apply_remote(table, &row.record_id, row.payload, row.updated_at)
                .await?;
            self.queue
                .mark_conflict(&pending.id, "record changed on the server since this mutation")
                .await?;
            report.conflicts += 1;
            tracing::warn!(
                table,
                record_id = %row.record_id,
                "pulled change overrode pending local mutation"
            );
            return Ok(());
        }

        self.records
            .apply_remote(table, &row.record_id, row.payload, row.updated_at)
            .await?;
        Ok(())
    }

    async fn apply_user_row(&self, row: &RemoteRow) -> Result<bool> {
        let Some(user) = LocalUser::from_payload(&row.payload) else {
            tracing::warn!(record_id = %row.record_id, "malformed user row skipped");
            return Ok(false);
        };
        self.users.upsert(&user).await?;
        Ok(true)
    }

    /// Reset failed entries and run a manual pass.
    pub async fn retry_failed(&self) -> Result<SyncReport> {
        let released = self.queue.retry_failed().await?;
        tracing::info!(released, "failed queue entries reset for retry");
        self.status.refresh().await?;
        self.sync(SyncTrigger::Manual).await
    }

    /// Manually resolve a conflict entry, then republish status.
    ///
    /// `keep_local` re-queues the discarded payload; otherwise the remote
    /// version stands and the entry is dropped.
    pub async fn resolve_conflict(&self, entry_id: &str, keep_local: bool) -> Result<()> {
        self.queue.resolve_conflict(entry_id, keep_local).await?;
        self.status.refresh().await?;
        Ok(())
    }
}
