//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tether_engine::{
    ConflictResolver, Fields, ManualClock, MergeStrategy, Module, Mutation, MutationQueue,
    Record, Schema, Store,
};

fn task_fields(i: u64) -> Fields {
    json!({"title": format!("Task {i}"), "priority": "high"})
        .as_object()
        .cloned()
        .unwrap_or_default()
}

fn populated_store(count: u64, clock: &ManualClock) -> Store {
    let mut store = Store::new(Schema::dashboard());
    for i in 0..count {
        store
            .create_with_id(Module::Tasks, format!("task_{i}"), task_fields(i), clock)
            .unwrap();
    }
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");
    let clock = ManualClock::new(1000);

    group.bench_function("create", |b| {
        let mut store = Store::new(Schema::dashboard());
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store.create(black_box(Module::Tasks), task_fields(i), &clock)
        })
    });

    group.bench_function("get_record", |b| {
        let store = populated_store(1000, &clock);
        b.iter(|| store.get(black_box(Module::Tasks), black_box("task_500")))
    });

    group.bench_function("update", |b| {
        let mut store = populated_store(1000, &clock);
        let patch = json!({"status": "done"}).as_object().cloned().unwrap_or_default();
        b.iter(|| store.update(Module::Tasks, black_box("task_500"), &patch, &clock))
    });

    group.bench_function("query_filtered", |b| {
        let store = populated_store(1000, &clock);
        b.iter(|| {
            store
                .query(Module::Tasks)
                .filter(|r| r.id.ends_with('7'))
                .count()
        })
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    let clock = ManualClock::new(1000);

    for size in [10u64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("drain", size), &size, |b, &size| {
            b.iter(|| {
                let mut queue = MutationQueue::new();
                for i in 0..size {
                    let mutation =
                        Mutation::update(Module::Tasks, &format!("task_{}", i % 16), &task_fields(i))
                            .unwrap();
                    queue.enqueue(mutation, &clock).unwrap();
                }
                while let Some(action) = queue.dequeue_next(&clock) {
                    queue.mark_done(action.id);
                }
                black_box(queue.size())
            })
        });
    }

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");

    let local = Record::new("7", Module::Tasks, task_fields(1), 1000);
    let mut remote = Record::new("7", Module::Tasks, task_fields(2), 1000);
    remote.updated_at = 2000;

    for strategy in [MergeStrategy::LastWriteWins, MergeStrategy::FieldMerge] {
        let resolver = ConflictResolver::new(strategy);
        group.bench_function(format!("{strategy:?}"), |b| {
            b.iter(|| resolver.resolve(black_box(&local), black_box(&remote)))
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let clock = ManualClock::new(1000);
    let store = populated_store(1000, &clock);

    group.bench_function("export_module", |b| {
        b.iter(|| store.export_module(black_box(Module::Tasks)))
    });

    let json = store.export_module(Module::Tasks).to_json().unwrap();
    group.bench_function("import_module", |b| {
        b.iter(|| {
            let mut restored = Store::new(Schema::dashboard());
            let snapshot = tether_engine::ModuleSnapshot::from_json(black_box(&json)).unwrap();
            restored.import_module(snapshot)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_queue,
    bench_conflicts,
    bench_snapshot,
);
criterion_main!(benches);
