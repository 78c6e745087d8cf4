//! End-to-end sync passes against the in-memory remote.

mod common;

use satchel_engine::{ChangeAction, Compatibility, IndicatorColor, SchemaVersion};
use satchel_client::error::ClientError;
use satchel_client::sync::SyncTrigger;
use serde_json::json;

#[tokio::test]
async fn offline_insert_then_sync() {
    let h = common::harness().await;

    h.records
        .upsert("products", "prod-1", json!({"name": "Paracetamol"}), "alice", None)
        .await
        .unwrap();

    // Queued while "offline": one pending entry, visible in the status.
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    assert_eq!(h.status.current().pending_count, 1);
    assert_eq!(h.status.current().indicator(), IndicatorColor::Pending);

    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.conflicts, 0);

    // Queue drained, remote has the row, status is green.
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert_eq!(h.status.current().pending_count, 0);
    assert_eq!(h.status.current().indicator(), IndicatorColor::Synced);
    let (remote_payload, _) = h.remote.row("products", "prod-1").unwrap();
    assert_eq!(remote_payload["name"], "Paracetamol");

    // Exactly one INSERT change record for the product.
    let history = h.audit.list_for_record("products", "prod-1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, ChangeAction::Insert);
    assert_eq!(history[0].actor, "alice");
}

#[tokio::test]
async fn sync_twice_makes_no_second_round_of_network_calls() {
    let h = common::harness().await;

    h.records
        .upsert("products", "prod-1", json!({"name": "Gauze"}), "alice", None)
        .await
        .unwrap();

    let report = h.engine.sync(SyncTrigger::Timer).await.unwrap();
    assert!(!report.skipped);
    let calls_after_first = h.remote.calls.network_total();

    let report = h.engine.sync(SyncTrigger::Timer).await.unwrap();
    assert!(report.skipped);
    assert_eq!(h.remote.calls.network_total(), calls_after_first);

    // And no duplicate audit entries either.
    let history = h.audit.list_for_record("products", "prod-1").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn server_wins_when_record_changed_both_sides() {
    let h = common::harness().await;

    // Create and sync so the record is acknowledged.
    h.records
        .upsert("products", "prod-1", json!({"name": "mine", "stock": 1}), "alice", None)
        .await
        .unwrap();
    h.engine.sync(SyncTrigger::Manual).await.unwrap();

    // Modify locally while another client modifies it remotely.
    h.records
        .upsert("products", "prod-1", json!({"name": "mine-v2", "stock": 2}), "alice", None)
        .await
        .unwrap();
    h.remote
        .seed_row("products", "prod-1", json!({"name": "theirs", "stock": 9}), "other-client");

    let conflicts_before = h.status.current().conflict_count;
    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts, 1);

    // Local state equals remote state.
    let local = h.records.get("products", "prod-1").await.unwrap().unwrap();
    assert_eq!(local.payload["name"], "theirs");
    assert_eq!(local.payload["stock"], 9);

    // The pending entry is out of the push pipeline, surfaced as a
    // conflict rather than silently dropped.
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert!(h.queue.dequeue_next().await.unwrap().is_none());
    let status = h.status.current();
    assert_eq!(status.conflict_count, conflicts_before + 1);
    assert_eq!(status.indicator(), IndicatorColor::Error);
}

#[tokio::test]
async fn failing_record_does_not_block_others() {
    let h = common::harness().await;

    h.records
        .upsert("products", "prod-a", json!({"name": "will fail"}), "alice", None)
        .await
        .unwrap();
    h.records
        .upsert("products", "prod-b", json!({"name": "will sync"}), "alice", None)
        .await
        .unwrap();

    // First upsert in the pass fails; the second record must still land.
    h.remote.fail_upserts(1);
    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 1);
    assert!(h.remote.row("products", "prod-b").is_some());
    assert!(h.remote.row("products", "prod-a").is_none());

    // The failed entry retries after its backoff and succeeds.
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.remote.row("products", "prod-a").is_some());
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn pull_applies_foreign_rows_and_skips_own() {
    let h = common::harness().await;

    // A row written by another client and one written by us.
    h.remote
        .seed_row("products", "theirs", json!({"name": "foreign"}), "other-client");
    h.remote
        .seed_row("products", "ours", json!({"name": "echo"}), common::TEST_CLIENT_ID);

    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pulled, 1);

    let foreign = h.records.get("products", "theirs").await.unwrap().unwrap();
    assert_eq!(foreign.payload["name"], "foreign");
    // The echo of our own write was not reapplied.
    assert!(h.records.get("products", "ours").await.unwrap().is_none());

    // The pulled row was audited as a system-applied change.
    let history = h.audit.list_for_record("products", "theirs").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actor, "system");
}

#[tokio::test]
async fn pull_cursor_prevents_reapplication() {
    let h = common::harness().await;

    h.remote
        .seed_row("products", "prod-1", json!({"name": "foreign"}), "other-client");

    h.engine.sync(SyncTrigger::Manual).await.unwrap();
    let history_len = h
        .audit
        .list_for_record("products", "prod-1")
        .await
        .unwrap()
        .len();

    // A second manual pass pulls nothing new for the unchanged row.
    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pulled, 0);
    assert_eq!(
        h.audit.list_for_record("products", "prod-1").await.unwrap().len(),
        history_len
    );
}

#[tokio::test]
async fn pulled_user_rows_retire_sentinel_admin() {
    let h = common::harness().await;

    assert!(h.auth.ensure_default_admin().await.unwrap());
    h.remote.seed_row(
        "app_users",
        "user-1",
        json!({
            "id": "user-1",
            "username": "dispenser",
            "full_name": "Dispenser One",
            "is_admin": false,
            "is_active": true
        }),
        "other-client",
    );

    h.engine.sync(SyncTrigger::Manual).await.unwrap();

    let users = h.users.get_all().await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "dispenser");
    assert!(!users[0].is_local_system());
}

#[tokio::test]
async fn transport_failure_aborts_pass_and_recovers() {
    let h = common::harness().await;

    h.records
        .upsert("products", "prod-1", json!({"name": "queued"}), "alice", None)
        .await
        .unwrap();

    // The push failure is contained per-operation, but the unreachable
    // pull phase aborts the pass.
    h.remote.set_offline(true);
    let result = h.engine.sync(SyncTrigger::Manual).await;
    assert!(result.is_err());
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    assert!(!h.status.current().last_sync.success);

    // Back online, the entry lands on the next pass once backoff allows.
    h.remote.set_offline(false);
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    let report = h.engine.sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn incompatible_backend_blocks_sync_and_login() {
    let remote = common::MockRemote::new();
    remote.set_schema(Some(SchemaVersion {
        schema_version: 99,
        min_app_version: 99,
        updated_at: None,
    }));
    let h = common::harness_with(remote, 60_000).await;

    assert!(matches!(h.gate.current(), Compatibility::AppTooOld { .. }));

    let sync_result = h.engine.sync(SyncTrigger::Manual).await;
    assert!(matches!(sync_result, Err(ClientError::Blocked(_))));

    let auth_result = h.auth.authenticate("admin", "admin").await;
    assert!(matches!(auth_result, Err(ClientError::Blocked(_))));

    let mutation_result = h
        .records
        .upsert("products", "prod-1", json!({"name": "nope"}), "alice", None)
        .await;
    assert!(matches!(mutation_result, Err(ClientError::Blocked(_))));
}

#[tokio::test]
async fn incompatibility_latches_across_offline_restart() {
    let remote = common::MockRemote::new();
    remote.set_schema(Some(SchemaVersion {
        schema_version: 99,
        min_app_version: 99,
        updated_at: None,
    }));
    let h = common::harness_with(remote, 60_000).await;
    assert!(matches!(h.gate.current(), Compatibility::AppTooOld { .. }));

    // Same database, new session, backend unreachable: still blocked.
    h.remote.set_offline(true);
    let remote_dyn: std::sync::Arc<dyn satchel_client::remote::RemoteStore> = h.remote.clone();
    let gate = satchel_client::compat::CompatibilityGate::new(Some(remote_dyn), h.meta.clone());
    let verdict = gate.check_at_startup().await.unwrap();
    assert!(matches!(verdict, Compatibility::AppTooOld { .. }));
}

#[tokio::test]
async fn realtime_echo_suppressed_and_foreign_applied() {
    let h = common::harness().await;

    let realtime = satchel_client::sync::RealtimeSync::new(
        satchel_engine::EchoFilter::new(common::TEST_CLIENT_ID),
        h.records.clone(),
        h.queue.clone(),
        h.status.clone(),
    );

    let echo = satchel_engine::ChangeEvent {
        table_name: "products".into(),
        record_id: "prod-1".into(),
        kind: satchel_engine::ChangeEventKind::Insert,
        row: json!({"id": "prod-1", "name": "ours", "client_id": common::TEST_CLIENT_ID}),
        updated_at: Some(5_000),
    };
    assert!(!realtime.handle_event(&echo).await.unwrap());
    assert!(h.records.get("products", "prod-1").await.unwrap().is_none());

    let foreign = satchel_engine::ChangeEvent {
        table_name: "products".into(),
        record_id: "prod-2".into(),
        kind: satchel_engine::ChangeEventKind::Insert,
        row: json!({"id": "prod-2", "name": "theirs", "client_id": "other-client"}),
        updated_at: Some(6_000),
    };
    assert!(realtime.handle_event(&foreign).await.unwrap());
    let stored = h.records.get("products", "prod-2").await.unwrap().unwrap();
    assert_eq!(stored.payload["name"], "theirs");
}

#[tokio::test]
async fn realtime_foreign_change_overrides_pending_mutation() {
    let h = common::harness().await;

    h.records
        .upsert("products", "prod-1", json!({"name": "mine"}), "alice", None)
        .await
        .unwrap();
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);

    let realtime = satchel_client::sync::RealtimeSync::new(
        satchel_engine::EchoFilter::new(common::TEST_CLIENT_ID),
        h.records.clone(),
        h.queue.clone(),
        h.status.clone(),
    );
    let event = satchel_engine::ChangeEvent {
        table_name: "products".into(),
        record_id: "prod-1".into(),
        kind: satchel_engine::ChangeEventKind::Update,
        row: json!({"id": "prod-1", "name": "theirs", "client_id": "other-client"}),
        updated_at: Some(7_000),
    };
    assert!(realtime.handle_event(&event).await.unwrap());

    let stored = h.records.get("products", "prod-1").await.unwrap().unwrap();
    assert_eq!(stored.payload["name"], "theirs");
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert_eq!(h.queue.conflict_count().await.unwrap(), 1);
}

#[tokio::test]
async fn status_watch_publishes_snapshots() {
    let h = common::harness().await;
    let mut rx = h.status.subscribe();

    h.records
        .upsert("products", "prod-1", json!({"name": "watched"}), "alice", None)
        .await
        .unwrap();

    rx.changed().await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.pending_count, 1);

    h.engine.sync(SyncTrigger::Manual).await.unwrap();
    let snapshot = h.status.current();
    assert_eq!(snapshot.pending_count, 0);
    assert!(snapshot.last_sync.success);
}
