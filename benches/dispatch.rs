//! Dispatch and decode benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feedwatch::{
    listener, ChangeEvent, ManagerConfig, NotificationManager, OperationType, RawRecord,
    ResumeToken, RetrievalMode, Scope, UpdateDescription,
};
use serde_json::json;

fn update_record(i: u64) -> RawRecord {
    let mut updated_fields = feedwatch::Document::new();
    updated_fields.insert("score".into(), json!(i));
    RawRecord {
        operation_type: "update".into(),
        collection_name: Some("users".into()),
        document_key: Some(json!(i)),
        full_document: Some(json!({"name": "user", "role": "admin", "score": i})),
        update_description: Some(UpdateDescription {
            updated_fields,
            removed_fields: Vec::new(),
        }),
        resume_token: Some(ResumeToken(i.to_le_bytes().to_vec())),
        cluster_time: Some(1_700_000_000_000_000),
    }
}

/// Benchmark record validation
fn bench_decode(c: &mut Criterion) {
    let record = update_record(42);
    c.bench_function("decode_update", |b| {
        b.iter(|| {
            ChangeEvent::decode(
                black_box(record.clone()),
                "users",
                RetrievalMode::UpdateLookup,
            )
            .unwrap()
        })
    });
}

/// Benchmark dispatch with varying listener counts
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let event = ChangeEvent::decode(update_record(1), "users", RetrievalMode::UpdateLookup).unwrap();

    for listeners in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("unfiltered", listeners),
            &listeners,
            |b, &n| {
                let manager = NotificationManager::new(ManagerConfig::default());
                for _ in 0..n {
                    manager
                        .register_listener(listener(|_| Ok(())), Scope::Global)
                        .unwrap();
                }
                b.iter(|| manager.dispatch(black_box(&event)));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("filtered", listeners),
            &listeners,
            |b, &n| {
                let manager = NotificationManager::new(ManagerConfig::default());
                for i in 0..n {
                    // Half the listeners reject the event.
                    let role = if i % 2 == 0 { "admin" } else { "guest" };
                    manager
                        .create_listener_builder(listener(|_| Ok(())), Scope::Global)
                        .filter_field("role", role)
                        .filter_operation([OperationType::Update, OperationType::Insert])
                        .register()
                        .unwrap();
                }
                b.iter(|| manager.dispatch(black_box(&event)));
            },
        );
    }

    group.finish();
}

/// Benchmark registration churn
fn bench_registration(c: &mut Criterion) {
    let manager = NotificationManager::new(ManagerConfig::default());
    for _ in 0..100 {
        manager
            .register_listener(listener(|_| Ok(())), Scope::Global)
            .unwrap();
    }

    c.bench_function("register_unregister", |b| {
        b.iter(|| {
            let id = manager
                .register_listener(listener(|_| Ok(())), Scope::Global)
                .unwrap();
            manager.unregister_registration(id)
        })
    });
}

criterion_group!(benches, bench_decode, bench_dispatch, bench_registration);
criterion_main!(benches);
