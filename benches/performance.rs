//! Performance benchmarks for the sync engine.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use roomsync::{
    humanize, Layout, MemoryTree, ReconcilePlan, Reconciler, SyncConfig, TreePath, TreeStore,
    WatchConfig,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn office(devices: usize, subscriptions: usize) -> Value {
    let mut catalog = Map::new();
    for d in 0..devices {
        let mut active = Map::new();
        let mut inactive = Map::new();
        for s in 0..subscriptions {
            let name = format!("sensor_channel{}Reading", s);
            if s % 2 == 0 {
                active.insert(name, json!({"channelID": s}));
            } else {
                inactive.insert(name, json!({"channelID": s}));
            }
        }
        catalog.insert(
            format!("0c2a69{:06}", d),
            json!({
                "name": format!("Sensor {}", d),
                "room": format!("room{}", d % 8),
                "activeStreams": active,
                "inactiveStreams": inactive
            }),
        );
    }
    json!({ "catalog": catalog })
}

fn reconciler(tree: &Arc<MemoryTree>) -> Reconciler {
    let store: Arc<dyn TreeStore> = tree.clone();
    Reconciler::new(store, Layout::new(&SyncConfig::default()))
}

/// Benchmark startup resync from an empty view
fn bench_resync_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("resync_all");

    for devices in [10, 100, 500] {
        let seed = office(devices, 8);
        group.bench_with_input(BenchmarkId::new("devices", devices), &seed, |b, seed| {
            b.iter_batched(
                || Arc::new(MemoryTree::from_json(seed.clone())),
                |tree| black_box(reconciler(&tree).resync_all().unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark resync when the view is already up to date
fn bench_resync_noop(c: &mut Criterion) {
    let mut group = c.benchmark_group("resync_noop");

    for devices in [10, 100, 500] {
        let tree = Arc::new(MemoryTree::from_json(office(devices, 8)));
        let reconciler = reconciler(&tree);
        reconciler.resync_all().unwrap();

        group.bench_with_input(BenchmarkId::new("devices", devices), &devices, |b, _| {
            b.iter(|| black_box(reconciler.resync_all().unwrap()));
        });
    }

    group.finish();
}

/// Benchmark plan computation
fn bench_plan(c: &mut Criterion) {
    let source: BTreeSet<String> = (0..1000).map(|i| format!("sub{}", i)).collect();
    let existing: BTreeSet<String> = (500..1500).map(|i| format!("sub{}", i)).collect();

    c.bench_function("plan_compute_1000", |b| {
        b.iter(|| black_box(ReconcilePlan::compute(&source, &existing)));
    });
}

/// Benchmark humanization
fn bench_humanize(c: &mut Criterion) {
    c.bench_function("humanize", |b| {
        b.iter(|| black_box(humanize(black_box("agent01_visibleLightLevelSensor"))));
    });
}

/// Benchmark writes with many watchers attached
fn bench_write_with_watchers(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_with_watchers");

    for watchers in [0, 10, 100] {
        let tree = MemoryTree::new();
        let handles: Vec<_> = (0..watchers)
            .map(|i| {
                let path = TreePath::parse(&format!("catalog/dev{}/activeStreams", i)).unwrap();
                tree.watch(&path, WatchConfig::live(16)).unwrap()
            })
            .collect();
        let target = TreePath::parse("catalog/dev0/activeStreams/sensor_temp").unwrap();

        group.bench_with_input(BenchmarkId::new("watchers", watchers), &watchers, |b, _| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                tree.write(&target, json!({"channelID": n})).unwrap();
                // Keep the watcher from overflowing.
                if let Some(handle) = handles.first() {
                    while handle.try_recv().is_ok() {}
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_resync_all,
    bench_resync_noop,
    bench_plan,
    bench_humanize,
    bench_write_with_watchers,
);

criterion_main!(benches);
