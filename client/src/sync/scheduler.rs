//! Background sync worker.
//!
//! A single task owns the engine, so at most one pass runs at a time.
//! Timer ticks, connectivity edges, and manual requests all funnel
//! through one channel; triggers arriving while a pass is running
//! coalesce into a single follow-up pass instead of piling up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::sync::{SyncEngine, SyncStatusManager, SyncTrigger};

/// Handle for interacting with the running worker.
#[derive(Clone)]
pub struct SyncHandle {
    trigger_tx: mpsc::Sender<SyncTrigger>,
    shutdown_tx: watch::Sender<bool>,
    cancel: Arc<AtomicBool>,
    status: Arc<SyncStatusManager>,
}

impl SyncHandle {
    /// Request an immediate sync pass ("sync now").
    ///
    /// If a pass is already running, the request is queued and a single
    /// follow-up pass runs right after it.
    pub async fn request_sync(&self) {
        // A full channel already guarantees a follow-up pass.
        let _ = self.trigger_tx.try_send(SyncTrigger::Manual);
    }

    /// Report a connectivity change. Regaining connectivity triggers a
    /// pass.
    pub async fn set_online(&self, is_online: bool) {
        if let Err(error) = self.status.set_online(is_online).await {
            tracing::warn!(%error, "failed to publish connectivity change");
        }
        if is_online {
            let _ = self.trigger_tx.try_send(SyncTrigger::Connectivity);
        }
    }

    /// Stop the worker: the in-flight operation completes, no new ones
    /// start, and the task exits.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the background worker.
pub fn start_scheduler(
    engine: Arc<SyncEngine>,
    status: Arc<SyncStatusManager>,
    interval: Duration,
) -> (SyncHandle, JoinHandle<()>) {
    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancel = engine.cancel_flag();

    let handle = SyncHandle {
        trigger_tx,
        shutdown_tx,
        cancel,
        status,
    };

    let worker = tokio::spawn(run_worker(engine, interval, trigger_rx, shutdown_rx));
    (handle, worker)
}

async fn run_worker(
    engine: Arc<SyncEngine>,
    interval: Duration,
    mut trigger_rx: mpsc::Receiver<SyncTrigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is quiet.
    ticker.tick().await;

    tracing::info!(interval_secs = interval.as_secs(), "sync worker started");

    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => SyncTrigger::Timer,
            received = trigger_rx.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        run_pass(&engine, trigger).await;

        // Coalesce triggers that arrived mid-pass into one follow-up.
        let mut follow_up: Option<SyncTrigger> = None;
        while let Ok(queued) = trigger_rx.try_recv() {
            if queued == SyncTrigger::Manual || follow_up.is_none() {
                follow_up = Some(queued);
            }
        }
        if let Some(trigger) = follow_up {
            run_pass(&engine, trigger).await;
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    tracing::info!("sync worker stopped");
}

async fn run_pass(engine: &SyncEngine, trigger: SyncTrigger) {
    // Pass failures are recorded in the published status; the worker
    // only logs and keeps running.
    if let Err(error) = engine.sync(trigger).await {
        tracing::warn!(?trigger, %error, "sync pass failed");
    }
}
