use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use olap_delta::model::{Dimension, Granularity, Measure, Model};
use olap_delta::pipeline::{CompiledModel, DeltaMode, executor};
use olap_delta::query::AggregateRequest;
use olap_delta::storage::MemoryStore;
use olap_delta::{Coordinator, OlapConfig};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tokio::runtime::Runtime;

const HOUR_MS: i64 = 3_600_000;

fn model() -> Model {
    Model::new("db.processes")
        .dimension(Dimension::time("ts", "ts", Granularity::Hour).unwrap())
        .dimension(Dimension::new("kind", "kind").unwrap())
        .measure(Measure::new("procLength", "procLength").unwrap())
}

fn document(i: usize) -> JsonValue {
    json!({
        "ts": 1589011200000i64 + (i as i64 % 500) * HOUR_MS / 4,
        "kind": format!("k{}", i % 8),
        "procLength": i % 100,
    })
}

async fn seeded(size: usize) -> (Arc<MemoryStore>, Coordinator) {
    let store = Arc::new(MemoryStore::new());
    for i in 0..size {
        store.insert_document("processes", document(i)).await.unwrap();
    }
    let coordinator = Coordinator::new(store.clone(), store.change_log(), OlapConfig::default());
    (store, coordinator)
}

/// Benchmark: Grouping shadow rows into cells in memory
fn bench_cells_pipeline(c: &mut Criterion) {
    let compiled = CompiledModel::compile(&model()).unwrap();
    let shadow: Vec<JsonValue> = (0..1000)
        .map(|i| {
            let mut row = document(i);
            row["_id"] = json!(i.to_string());
            row
        })
        .collect();
    let projected = executor::run(&compiled.shadow_pipeline(None).stages, shadow).unwrap();
    let cells = compiled.cells_pipeline(DeltaMode::Insert);

    c.bench_function("cells_pipeline_1000", |b| {
        b.iter(|| black_box(executor::run(&cells.stages, projected.clone()).unwrap()))
    });
}

/// Benchmark: Full cube build
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("cube_build");

    for size in [100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let (_store, coordinator) = seeded(size).await;
                black_box(coordinator.create_cube("bench", model(), None, false).await.unwrap())
            });
        });
    }
    group.finish();
}

/// Benchmark: Delta for a batch of changed documents on a built cube
fn bench_delta(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, coordinator) = rt.block_on(async {
        let seeded = seeded(2000).await;
        seeded.1.create_cube("bench", model(), None, false).await.unwrap();
        seeded
    });

    let mut group = c.benchmark_group("cube_delta");
    for batch in [1, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.to_async(Runtime::new().unwrap()).iter(|| {
                let store = store.clone();
                let coordinator = coordinator.clone();
                async move {
                    for i in 0..batch {
                        store.insert_document("processes", document(i)).await.unwrap();
                    }
                    black_box(coordinator.update_aggregates().await.unwrap())
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: Query with a coarser time granularity
fn bench_query(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_store, coordinator) = rt.block_on(async {
        let seeded = seeded(2000).await;
        seeded.1.create_cube("bench", model(), None, false).await.unwrap();
        seeded
    });
    let request = AggregateRequest::new()
        .dimension_at("ts", Granularity::Day)
        .measure("procLength");

    c.bench_function("query_by_day", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| {
            let coordinator = coordinator.clone();
            let request = request.clone();
            async move { black_box(coordinator.aggregate("bench", request).await.unwrap()) }
        })
    });
}

criterion_group!(benches, bench_cells_pipeline, bench_build, bench_delta, bench_query);
criterion_main!(benches);
