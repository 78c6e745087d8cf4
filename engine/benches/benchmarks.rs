//! Performance benchmarks for satchel-engine

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use satchel_engine::{
    check_compatibility, coalesce, ChangeAction, ChangeEvent, ChangeEventKind, EchoFilter,
    LastSyncInfo, QueuedOperation, SchemaVersion, SyncStatus,
};
use serde_json::json;

fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");

    let pending = QueuedOperation::new(
        "q-1",
        "products",
        "prod-1",
        ChangeAction::Insert,
        json!({"name": "Test Product", "stock": 100}),
        1000,
    );

    group.bench_function("against_pending_insert", |b| {
        b.iter(|| coalesce(black_box(Some(&pending)), black_box(ChangeAction::Update)))
    });

    group.bench_function("against_empty_slot", |b| {
        b.iter(|| coalesce(black_box(None), black_box(ChangeAction::Insert)))
    });

    group.finish();
}

fn bench_status_indicator(c: &mut Criterion) {
    let status = SyncStatus {
        pending_count: 42,
        conflict_count: 0,
        is_online: true,
        is_syncing: false,
        sync_mode: Default::default(),
        last_sync: LastSyncInfo::success(1706745600000),
    };

    c.bench_function("status_indicator", |b| {
        b.iter(|| black_box(&status).indicator())
    });
}

fn bench_echo_filter(c: &mut Criterion) {
    let filter = EchoFilter::new("client-a");
    let event = ChangeEvent {
        table_name: "products".into(),
        record_id: "prod-1".into(),
        kind: ChangeEventKind::Update,
        row: json!({"id": "prod-1", "name": "Test", "client_id": "client-b"}),
        updated_at: Some(1706745600000),
    };

    c.bench_function("echo_filter_should_process", |b| {
        b.iter(|| filter.should_process(black_box(&event)))
    });
}

fn bench_compatibility(c: &mut Criterion) {
    let row = SchemaVersion {
        schema_version: 2,
        min_app_version: 1,
        updated_at: None,
    };

    c.bench_function("check_compatibility", |b| {
        b.iter(|| check_compatibility(black_box(Some(&row))))
    });
}

criterion_group!(
    benches,
    bench_coalesce,
    bench_status_indicator,
    bench_echo_filter,
    bench_compatibility
);
criterion_main!(benches);
