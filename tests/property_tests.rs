/// Property tests: whatever sequence of source writes and update ticks
/// happens, an incrementally maintained cube answers exactly like a cube
/// built from scratch over the final source state.
use olap_delta::model::{Dimension, Measure, Model};
use olap_delta::query::{AggregateRequest, AggregateRow};
use olap_delta::storage::MemoryStore;
use olap_delta::{Coordinator, OlapConfig};
use proptest::prelude::*;
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Put {
        id: u8,
        city: Option<u8>,
        tags: Vec<u8>,
        value: Option<i64>,
    },
    Delete {
        id: u8,
    },
    Tick,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (
            0u8..6,
            proptest::option::of(0u8..3),
            proptest::collection::vec(0u8..3, 0..3),
            proptest::option::of(-50i64..50),
        )
            .prop_map(|(id, city, tags, value)| Op::Put { id, city, tags, value }),
        2 => (0u8..6).prop_map(|id| Op::Delete { id }),
        1 => Just(Op::Tick),
    ]
}

fn model() -> Model {
    Model::new("db.things")
        .dimension(Dimension::new("city", "city").unwrap())
        .dimension(Dimension::new("tags[]", "tag").unwrap())
        .measure(Measure::new("value", "value").unwrap())
}

fn document(city: Option<u8>, tags: &[u8], value: Option<i64>) -> JsonValue {
    let mut doc = Map::new();
    if let Some(city) = city {
        doc.insert("city".to_string(), json!(format!("city-{}", city)));
    }
    doc.insert(
        "tags".to_string(),
        json!(tags.iter().map(|t| format!("t{}", t)).collect::<Vec<_>>()),
    );
    if let Some(value) = value {
        doc.insert("value".to_string(), json!(value));
    }
    JsonValue::Object(doc)
}

async fn apply(store: &MemoryStore, coordinator: &Coordinator, op: &Op) {
    match op {
        Op::Put { id, city, tags, value } => {
            let id = format!("doc-{}", id);
            let doc = document(*city, tags, *value);
            if !store.replace_document("things", &id, doc.clone()).await.unwrap() {
                let mut doc = doc;
                doc["_id"] = json!(id);
                store.insert_document("things", doc).await.unwrap();
            }
        }
        Op::Delete { id } => {
            store.delete_document("things", &format!("doc-{}", id)).await.unwrap();
        }
        Op::Tick => {
            coordinator.update_aggregates().await.unwrap();
        }
    }
}

fn full_request() -> AggregateRequest {
    AggregateRequest::new().dimension("city").dimension("tag").measure("value")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn run_ops(ops: &[Op], build_first: bool) -> (Vec<AggregateRow>, Vec<AggregateRow>) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), store.change_log(), OlapConfig::default());

    let split = if build_first { 0 } else { ops.len() / 2 };
    for op in &ops[..split] {
        if !matches!(op, Op::Tick) {
            apply(&store, &coordinator, op).await;
        }
    }
    coordinator.create_cube("incremental", model(), None, false).await.unwrap();
    for op in &ops[split..] {
        apply(&store, &coordinator, op).await;
    }

    let incremental = coordinator.aggregate("incremental", full_request()).await.unwrap();
    coordinator.create_cube("scratch", model(), None, false).await.unwrap();
    let scratch = coordinator.aggregate("scratch", full_request()).await.unwrap();
    (incremental, scratch)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_incremental_equals_rebuild(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let (incremental, scratch) = runtime().block_on(run_ops(&ops, true));
        prop_assert_eq!(incremental, scratch);
    }

    #[test]
    fn prop_incremental_after_initial_build(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let (incremental, scratch) = runtime().block_on(run_ops(&ops, false));
        prop_assert_eq!(incremental, scratch);
    }

    #[test]
    fn prop_no_empty_cells(ops in proptest::collection::vec(arb_op(), 0..40)) {
        let (incremental, _) = runtime().block_on(run_ops(&ops, true));
        prop_assert!(incremental.iter().all(|row| row.count > 0));
    }

    #[test]
    fn prop_rebuild_is_idempotent(ops in proptest::collection::vec(arb_op(), 0..30)) {
        let rows = runtime().block_on(async {
            let store = Arc::new(MemoryStore::new());
            let coordinator = Coordinator::new(store.clone(), store.change_log(), OlapConfig::default());
            coordinator.create_cube("main", model(), None, true).await.unwrap();
            for op in &ops {
                apply(&store, &coordinator, op).await;
            }

            coordinator.rebuild_cube("main").await.unwrap();
            let first = coordinator.aggregate("main", full_request()).await.unwrap();
            coordinator.rebuild_cube("main").await.unwrap();
            let second = coordinator.aggregate("main", full_request()).await.unwrap();
            (first, second)
        });
        prop_assert_eq!(rows.0, rows.1);
    }
}
