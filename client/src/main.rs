//! Satchel daemon - composition root for the sync client.
//!
//! Wires storage, remote access, the compatibility gate, the auth bridge,
//! and the background sync worker together, then runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use satchel_client::auth::AuthBridge;
use satchel_client::compat::CompatibilityGate;
use satchel_client::config::Config;
use satchel_client::db::{
    self, AuditStore, LocalStore, MetaStore, QueueStore, UserStore, USERS_TABLE,
};
use satchel_client::remote::{HttpRemote, RemoteStore};
use satchel_client::sync::{start_scheduler, SyncEngine, SyncStatusManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tables the pull phase covers, in dependency order.
const SYNC_TABLES: &[&str] = &[
    "sites",
    "packaging_types",
    "categories",
    "products",
    "customers",
    USERS_TABLE,
    "suppliers",
    "purchase_batches",
    "sales",
    "sale_items",
    "stock_movements",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "satchel_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(database = %config.database_path, "starting Satchel client");

    // Storage
    let pool = db::create_pool(&config.database_path).await?;
    db::run_migrations(&pool).await?;

    let audit = AuditStore::new(pool.clone());
    audit.install_triggers().await?;

    let queue = QueueStore::new(pool.clone());
    let users = UserStore::new(pool.clone());
    let meta = MetaStore::new(pool.clone());

    // Status publication; the records store republishes after every
    // repository mutation.
    let status = Arc::new(SyncStatusManager::new(queue.clone(), meta.clone()));
    status.load().await?;

    let client_id = meta.ensure_client_id().await?;

    // Remote
    let remote: Option<Arc<dyn RemoteStore>> = config.remote.as_ref().map(|remote_config| {
        Arc::new(HttpRemote::new(
            &remote_config.base_url,
            &remote_config.api_key,
            &client_id,
        )) as Arc<dyn RemoteStore>
    });

    // Compatibility gate runs before anything else may touch the remote.
    let gate = Arc::new(CompatibilityGate::new(remote.clone(), meta.clone()));
    let verdict = gate.check_at_startup().await?;
    let allowed = gate.ensure_allowed().is_ok();
    if !allowed {
        tracing::error!(verdict = %verdict.describe(), "client blocked, nothing to do");
    }

    let records = LocalStore::new(pool.clone())
        .with_status(status.clone())
        .with_gate(gate.clone());

    // Auth bridge and the sentinel admin for offline first use.
    let auth = Arc::new(AuthBridge::new(
        users.clone(),
        meta.clone(),
        remote.clone(),
        gate.clone(),
    ));
    if allowed && auth.ensure_default_admin().await? {
        tracing::info!("sentinel admin available until real identities sync in");
    }

    status.set_online(remote.is_some()).await?;

    // Sync worker, only when a remote is configured and the gate passed.
    let worker = match (remote, allowed) {
        (Some(remote), true) => {
            let engine = Arc::new(SyncEngine::new(
                records,
                queue,
                users,
                meta,
                remote,
                status.clone(),
                gate,
                auth,
                SYNC_TABLES.iter().map(|t| t.to_string()).collect(),
                config.site_id.clone(),
                client_id,
                Duration::from_secs(config.sync_interval_secs).as_millis() as i64,
            ));
            let (handle, worker) = start_scheduler(
                engine,
                status.clone(),
                Duration::from_secs(config.sync_interval_secs),
            );
            Some((handle, worker))
        }
        _ => {
            tracing::info!("no remote configured or session blocked, running local-only");
            None
        }
    };

    // Run until interrupted.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    if let Some((handle, worker)) = worker {
        handle.shutdown();
        let _ = worker.await;
    }

    Ok(())
}
