//! Shared test fixtures: a tempfile-backed database and an in-memory
//! remote with call counters.

// Each test binary uses a subset of the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use satchel_client::auth::AuthBridge;
use satchel_client::compat::CompatibilityGate;
use satchel_client::db::{
    self, AuditStore, LocalStore, MetaStore, Pool, QueueStore, UserStore,
};
use satchel_client::remote::{
    AuthExchange, RemoteAuthUser, RemoteError, RemoteRow, RemoteStore, SessionTokens,
};
use satchel_client::sync::{SyncEngine, SyncStatusManager};
use satchel_engine::SchemaVersion;

/// The client identifier every harness uses.
pub const TEST_CLIENT_ID: &str = "client-under-test";

/// A throwaway on-disk database with migrations and triggers applied.
pub struct TestDb {
    pub pool: Pool,
    _dir: tempfile::TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("satchel-test.db");
    let pool = db::create_pool(path.to_str().expect("utf-8 temp path"))
        .await
        .expect("create pool");
    db::run_migrations(&pool).await.expect("run migrations");
    AuditStore::new(pool.clone())
        .install_triggers()
        .await
        .expect("install triggers");
    TestDb { pool, _dir: dir }
}

#[derive(Default)]
pub struct CallCounts {
    pub upserts: AtomicU64,
    pub deletes: AtomicU64,
    pub fetches: AtomicU64,
    pub pulls: AtomicU64,
    pub schema_probes: AtomicU64,
    pub sign_ins: AtomicU64,
    pub provisions: AtomicU64,
}

impl CallCounts {
    pub fn network_total(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
            + self.fetches.load(Ordering::SeqCst)
            + self.pulls.load(Ordering::SeqCst)
            + self.schema_probes.load(Ordering::SeqCst)
            + self.sign_ins.load(Ordering::SeqCst)
            + self.provisions.load(Ordering::SeqCst)
    }
}

/// In-memory stand-in for the backend.
pub struct MockRemote {
    rows: Mutex<HashMap<(String, String), (serde_json::Value, i64)>>,
    schema: Mutex<Option<SchemaVersion>>,
    legacy_accounts: Mutex<HashMap<String, String>>,
    migrated_accounts: Mutex<HashMap<String, String>>,
    clock: AtomicI64,
    offline: AtomicBool,
    fail_next_upserts: AtomicU64,
    pub calls: CallCounts,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            schema: Mutex::new(None),
            legacy_accounts: Mutex::new(HashMap::new()),
            migrated_accounts: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(1_000_000),
            offline: AtomicBool::new(false),
            fail_next_upserts: AtomicU64::new(0),
            calls: CallCounts::default(),
        }
    }
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_ts(&self) -> i64 {
        self.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(())
    }

    /// Simulate losing / regaining connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` upserts with a transport error.
    pub fn fail_upserts(&self, n: u64) {
        self.fail_next_upserts.store(n, Ordering::SeqCst);
    }

    /// Plant a row as if another client had written it.
    pub fn seed_row(
        &self,
        table: &str,
        record_id: &str,
        mut payload: serde_json::Value,
        writer_client_id: &str,
    ) -> i64 {
        let ts = self.next_ts();
        if let Some(object) = payload.as_object_mut() {
            object.insert("id".into(), serde_json::json!(record_id));
            object.insert("client_id".into(), serde_json::json!(writer_client_id));
            object.insert("updated_at".into(), serde_json::json!(ts));
        }
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), record_id.to_string()), (payload, ts));
        ts
    }

    pub fn row(&self, table: &str, record_id: &str) -> Option<(serde_json::Value, i64)> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), record_id.to_string()))
            .cloned()
    }

    pub fn set_schema(&self, schema: Option<SchemaVersion>) {
        *self.schema.lock().unwrap() = schema;
    }

    pub fn add_legacy_account(&self, username: &str, password: &str) {
        self.legacy_accounts
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
    }

    pub fn is_migrated(&self, username: &str) -> bool {
        self.migrated_accounts.lock().unwrap().contains_key(username)
    }

    fn exchange_for(&self, username: &str) -> AuthExchange {
        AuthExchange {
            user: RemoteAuthUser {
                id: format!("remote-{username}"),
                username: username.to_string(),
                name: username.to_string(),
                is_admin: false,
            },
            session: SessionTokens {
                access_token: format!("access-{username}"),
                refresh_token: format!("refresh-{username}"),
                expires_at: Some(4_102_444_800),
            },
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn upsert_row(
        &self,
        table: &str,
        record_id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteRow, RemoteError> {
        self.calls.upserts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self
            .fail_next_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::Transport("simulated upsert failure".into()));
        }

        let ts = self.next_ts();
        let mut stored = payload.clone();
        if let Some(object) = stored.as_object_mut() {
            object.insert("id".into(), serde_json::json!(record_id));
            object.insert("client_id".into(), serde_json::json!(TEST_CLIENT_ID));
            object.insert("updated_at".into(), serde_json::json!(ts));
        }
        self.rows.lock().unwrap().insert(
            (table.to_string(), record_id.to_string()),
            (stored.clone(), ts),
        );
        Ok(RemoteRow {
            record_id: record_id.to_string(),
            payload: stored,
            updated_at: Some(ts),
        })
    }

    async fn delete_row(&self, table: &str, record_id: &str) -> Result<(), RemoteError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.rows
            .lock()
            .unwrap()
            .remove(&(table.to_string(), record_id.to_string()));
        Ok(())
    }

    async fn fetch_row(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<RemoteRow>, RemoteError> {
        self.calls.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .row(table, record_id)
            .map(|(payload, updated_at)| RemoteRow {
                record_id: record_id.to_string(),
                payload,
                updated_at: Some(updated_at),
            }))
    }

    async fn changed_since(
        &self,
        table: &str,
        since: Option<i64>,
        _site_id: Option<&str>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.calls.pulls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<RemoteRow> = rows
            .iter()
            .filter(|((t, _), (_, ts))| t.as_str() == table && since.map_or(true, |s| *ts > s))
            .map(|((_, id), (payload, ts))| RemoteRow {
                record_id: id.clone(),
                payload: payload.clone(),
                updated_at: Some(*ts),
            })
            .collect();
        matched.sort_by_key(|row| row.updated_at);
        Ok(matched)
    }

    async fn schema_version(&self) -> Result<Option<SchemaVersion>, RemoteError> {
        self.calls.schema_probes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn sign_in(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError> {
        self.calls.sign_ins.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let migrated = self.migrated_accounts.lock().unwrap().get(username).cloned();
        match migrated {
            Some(stored) if stored == password => Ok(self.exchange_for(username)),
            _ => Err(RemoteError::AuthRejected {
                message: "Invalid login credentials".into(),
            }),
        }
    }

    async fn provision_legacy(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError> {
        self.calls.provisions.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let known = {
            let legacy = self.legacy_accounts.lock().unwrap();
            let migrated = self.migrated_accounts.lock().unwrap();
            legacy
                .get(username)
                .or_else(|| migrated.get(username))
                .cloned()
        };
        match known {
            Some(stored) if stored == password => {
                let mut legacy = self.legacy_accounts.lock().unwrap();
                let secret = legacy.remove(username).unwrap_or(stored);
                self.migrated_accounts
                    .lock()
                    .unwrap()
                    .insert(username.to_string(), secret);
                Ok(self.exchange_for(username))
            }
            _ => Err(RemoteError::AuthRejected {
                message: "legacy verification failed".into(),
            }),
        }
    }
}

/// Everything a sync test needs, wired the way the daemon wires it.
pub struct Harness {
    pub pool: Pool,
    pub records: LocalStore,
    pub queue: QueueStore,
    pub users: UserStore,
    pub meta: MetaStore,
    pub audit: AuditStore,
    pub status: Arc<SyncStatusManager>,
    pub gate: Arc<CompatibilityGate>,
    pub auth: Arc<AuthBridge>,
    pub engine: SyncEngine,
    pub remote: Arc<MockRemote>,
    _db: TestDb,
}

/// Tables the test harness syncs.
pub const TEST_TABLES: &[&str] = &["products", "app_users"];

pub async fn harness() -> Harness {
    harness_with(MockRemote::new(), 60_000).await
}

pub async fn harness_with(remote: Arc<MockRemote>, min_pull_interval_ms: i64) -> Harness {
    let db = test_db().await;
    let pool = db.pool.clone();

    let queue = QueueStore::new(pool.clone());
    let users = UserStore::new(pool.clone());
    let meta = MetaStore::new(pool.clone());
    let audit = AuditStore::new(pool.clone());

    meta.set("client_id", TEST_CLIENT_ID)
        .await
        .expect("seed client id");

    let remote_dyn: Arc<dyn RemoteStore> = remote.clone();
    let gate = Arc::new(CompatibilityGate::new(Some(remote_dyn.clone()), meta.clone()));
    gate.check_at_startup().await.expect("gate check");

    let auth = Arc::new(AuthBridge::new(
        users.clone(),
        meta.clone(),
        Some(remote_dyn.clone()),
        gate.clone(),
    ));

    let status = Arc::new(SyncStatusManager::new(queue.clone(), meta.clone()));
    status.load().await.expect("status load");
    status.set_online(true).await.expect("status online");

    let records = LocalStore::new(pool.clone())
        .with_status(status.clone())
        .with_gate(gate.clone());

    let engine = SyncEngine::new(
        records.clone(),
        queue.clone(),
        users.clone(),
        meta.clone(),
        remote_dyn,
        status.clone(),
        gate.clone(),
        auth.clone(),
        TEST_TABLES.iter().map(|t| t.to_string()).collect(),
        None,
        TEST_CLIENT_ID.to_string(),
        min_pull_interval_ms,
    );

    Harness {
        pool: pool.clone(),
        records,
        queue,
        users,
        meta,
        audit,
        status,
        gate,
        auth,
        engine,
        remote,
        _db: db,
    }
}
