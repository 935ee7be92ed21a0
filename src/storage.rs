/// Storage collaborator for olap-delta.
///
/// Cubes never touch documents directly. They hand pipelines to a
/// [`CubeStorage`] implementation, which must be able to:
///
/// - Run a pipeline over a collection and return the rows, or write them
///   into another collection (`Out` replaces, `Merge` inserts or accumulates)
/// - Enforce unique indexes over composite keys
/// - Commit a batch of metadata writes all-or-nothing
///
/// [`MemoryStore`] is the in-process implementation. It also plays the
/// operational database: source writes made through it are appended to an
/// attached [`MemoryChangeLog`], which is what the cubes consume.
///
/// The store is thread-safe and uses DashMap for concurrent access to
/// collections; every sink stage is applied under a single collection lock.
use crate::error::{OlapError, OlapResult};
use crate::feed::MemoryChangeLog;
use crate::pipeline::executor::{self, merge_key, merge_rows};
use crate::pipeline::{IndexSpec, Pipeline, Stage};
use crate::query::Filter;
use crate::types::{
    ChangeOp, CoordinatorState, CubeMetadata, DocumentId, ID_FIELD, Watermark, id_to_string,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// One statement of a metadata commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataWrite {
    /// Insert or replace a cube's record.
    Put(CubeMetadata),
    /// Flip the `valid` flag of an existing record.
    SetValid { id: String, valid: bool },
    /// Record progress: set `lastProcessed` and mark the cube valid.
    SetProgress { id: String, last_processed: Watermark },
    /// Remove a record.
    Remove { id: String },
}

/// Storage collaborator.
#[async_trait]
pub trait CubeStorage: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> OlapResult<()>;

    async fn collection_exists(&self, name: &str) -> OlapResult<bool>;

    /// Create an empty collection. Existing collections are left as they are.
    async fn create_collection(&self, name: &str) -> OlapResult<()>;

    /// Drop a collection, returning whether it existed.
    async fn drop_collection(&self, name: &str) -> OlapResult<bool>;

    /// Run `pipeline` over `collection`.
    ///
    /// Returns the produced rows, or nothing if the pipeline ends in a sink
    /// stage. A missing source collection reads as empty.
    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> OlapResult<Vec<JsonValue>>;

    async fn find(&self, collection: &str, filter: &Filter) -> OlapResult<Vec<JsonValue>>;

    /// Insert rows all-or-nothing, returning how many were written.
    async fn insert_many(&self, collection: &str, rows: Vec<JsonValue>) -> OlapResult<usize>;

    /// Delete matching rows, returning how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> OlapResult<usize>;

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> OlapResult<()>;

    async fn list_indexes(&self, collection: &str) -> OlapResult<Vec<IndexSpec>>;

    async fn find_metadata(&self, id: &str) -> OlapResult<Option<CubeMetadata>>;

    async fn list_metadata(&self) -> OlapResult<Vec<CubeMetadata>>;

    /// Apply every write or none of them.
    async fn commit(&self, writes: Vec<MetadataWrite>) -> OlapResult<()>;

    async fn load_state(&self) -> OlapResult<Option<CoordinatorState>>;

    async fn save_state(&self, state: &CoordinatorState) -> OlapResult<()>;
}

/// Rows of one collection in insertion order, plus its indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    rows: BTreeMap<u64, JsonValue>,
    next_seq: u64,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn values(&self) -> Vec<JsonValue> {
        self.rows.values().cloned().collect()
    }

    fn unique_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.iter().filter(|i| i.unique)
    }

    fn duplicate_error(index: &IndexSpec, key: &str) -> OlapError {
        OlapError::StorageError(format!(
            "duplicate key {} violates unique index '{}'",
            key, index.name
        ))
    }

    fn check_unique(index: &IndexSpec, rows: &[&JsonValue]) -> OlapResult<()> {
        let mut seen = HashSet::new();
        for row in rows {
            if let Some(key) = merge_key(row, &index.fields) {
                if !seen.insert(key.clone()) {
                    return Err(Self::duplicate_error(index, &key));
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, row: JsonValue) {
        self.rows.insert(self.next_seq, row);
        self.next_seq += 1;
    }

    fn insert_rows(&mut self, rows: Vec<JsonValue>) -> OlapResult<usize> {
        for index in self.unique_indexes() {
            let all: Vec<&JsonValue> = self.rows.values().chain(rows.iter()).collect();
            Self::check_unique(index, &all)?;
        }
        let written = rows.len();
        for row in rows {
            self.push(row);
        }
        Ok(written)
    }

    fn replace_rows(&mut self, rows: Vec<JsonValue>) -> OlapResult<()> {
        for index in self.unique_indexes() {
            Self::check_unique(index, &rows.iter().collect::<Vec<_>>())?;
        }
        self.rows.clear();
        for row in rows {
            self.push(row);
        }
        Ok(())
    }

    fn merge(&mut self, rows: Vec<JsonValue>, on: &[String], accumulate: &[String]) {
        let mut by_key: std::collections::HashMap<String, u64> = self
            .rows
            .iter()
            .filter_map(|(seq, row)| merge_key(row, on).map(|k| (k, *seq)))
            .collect();

        for row in rows {
            let key = merge_key(&row, on);
            match key.as_ref().and_then(|k| by_key.get(k)).and_then(|seq| self.rows.get_mut(seq)) {
                Some(existing) => merge_rows(existing, &row, accumulate),
                None => {
                    if let Some(key) = key {
                        by_key.insert(key, self.next_seq);
                    }
                    self.push(row);
                }
            }
        }
    }

    fn delete_where(&mut self, filter: &Filter) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, row| !filter.matches_value(row));
        before - self.rows.len()
    }

    fn position_of(&self, id: &str) -> Option<u64> {
        self.rows
            .iter()
            .find(|(_, row)| row.get(ID_FIELD).map(id_to_string).as_deref() == Some(id))
            .map(|(seq, _)| *seq)
    }
}

/// Everything a [`MemoryStore`] holds, in serializable form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub collections: BTreeMap<String, Collection>,
    pub metadata: Vec<CubeMetadata>,
    pub state: Option<CoordinatorState>,
    pub change_log: Vec<crate::types::ChangeRecord>,
}

/// In-memory storage with an attached change log.
#[derive(Debug)]
pub struct MemoryStore {
    collections: DashMap<String, Collection>,
    metadata: RwLock<BTreeMap<String, CubeMetadata>>,
    state: RwLock<Option<CoordinatorState>>,
    log: Arc<MemoryChangeLog>,
    /// Remaining operations before the store goes offline; negative is unlimited.
    budget: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store with a fresh change log.
    pub fn new() -> Self {
        Self::with_change_log(Arc::new(MemoryChangeLog::new()))
    }

    /// Create an empty store writing to `log`.
    pub fn with_change_log(log: Arc<MemoryChangeLog>) -> Self {
        Self {
            collections: DashMap::new(),
            metadata: RwLock::new(BTreeMap::new()),
            state: RwLock::new(None),
            log,
            budget: AtomicI64::new(-1),
        }
    }

    /// Rebuild a store (and its change log) from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::with_change_log(Arc::new(MemoryChangeLog::from_records(
            snapshot.change_log,
        )));
        for (name, collection) in snapshot.collections {
            store.collections.insert(name, collection);
        }
        Self {
            metadata: RwLock::new(
                snapshot
                    .metadata
                    .into_iter()
                    .map(|m| (m.id.clone(), m))
                    .collect(),
            ),
            state: RwLock::new(snapshot.state),
            ..store
        }
    }

    /// Capture a consistent-enough copy of the store for persistence.
    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            collections: self
                .collections
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            metadata: self.metadata.read().await.values().cloned().collect(),
            state: self.state.read().await.clone(),
            change_log: self.log.records().await,
        }
    }

    /// The change log source writes are appended to.
    pub fn change_log(&self) -> Arc<MemoryChangeLog> {
        Arc::clone(&self.log)
    }

    /// Take the store offline (`false`) or bring it back (`true`).
    pub fn set_available(&self, available: bool) {
        self.budget
            .store(if available { -1 } else { 0 }, Ordering::SeqCst);
    }

    /// Allow `operations` more calls, then go offline.
    pub fn fail_after(&self, operations: i64) {
        self.budget.store(operations.max(0), Ordering::SeqCst);
    }

    fn check(&self) -> OlapResult<()> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(OlapError::StorageUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        if left > 0 {
            self.budget.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Number of rows in a collection (0 if it does not exist).
    pub fn count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Insert a source document and record the change.
    ///
    /// A document without `_id` gets a generated one.
    pub async fn insert_document(&self, collection: &str, mut document: JsonValue) -> OlapResult<DocumentId> {
        self.check()?;
        let JsonValue::Object(map) = &mut document else {
            return Err(OlapError::validation("documents must be JSON objects"));
        };
        let id = match map.get(ID_FIELD) {
            Some(id) => id_to_string(id),
            None => {
                let generated = uuid::Uuid::new_v4().to_string();
                map.insert(ID_FIELD.to_string(), JsonValue::String(generated.clone()));
                generated
            }
        };

        {
            let mut target = self.collections.entry(collection.to_string()).or_default();
            if target.position_of(&id).is_some() {
                return Err(OlapError::StorageError(format!(
                    "document '{}' already exists in '{}'",
                    id, collection
                )));
            }
            target.push(document.clone());
        }

        self.log
            .append(collection, ChangeOp::Insert, Some(document), None)
            .await;
        Ok(id)
    }

    /// Replace a source document, keeping its id. Returns false if absent.
    pub async fn replace_document(&self, collection: &str, id: &str, mut document: JsonValue) -> OlapResult<bool> {
        self.check()?;
        let JsonValue::Object(map) = &mut document else {
            return Err(OlapError::validation("documents must be JSON objects"));
        };

        let stored_id = match self.collections.get_mut(collection) {
            Some(mut target) => match target.position_of(id) {
                Some(seq) => {
                    let stored_id = target.rows.get(&seq).and_then(|row| row.get(ID_FIELD)).cloned();
                    let stored_id = stored_id.unwrap_or_else(|| JsonValue::String(id.to_string()));
                    map.insert(ID_FIELD.to_string(), stored_id.clone());
                    target.rows.insert(seq, document);
                    Some(stored_id)
                }
                None => None,
            },
            None => None,
        };

        let Some(stored_id) = stored_id else {
            return Ok(false);
        };
        self.log
            .append(
                collection,
                ChangeOp::Update,
                None,
                Some(serde_json::json!({ ID_FIELD: stored_id })),
            )
            .await;
        Ok(true)
    }

    /// Delete a source document. Returns false if absent.
    pub async fn delete_document(&self, collection: &str, id: &str) -> OlapResult<bool> {
        self.check()?;
        let removed = match self.collections.get_mut(collection) {
            Some(mut target) => match target.position_of(id) {
                Some(seq) => target.rows.remove(&seq).is_some(),
                None => false,
            },
            None => false,
        };

        if removed {
            self.log
                .append(
                    collection,
                    ChangeOp::Delete,
                    Some(serde_json::json!({ ID_FIELD: id })),
                    None,
                )
                .await;
        }
        Ok(removed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CubeStorage for MemoryStore {
    async fn ping(&self) -> OlapResult<()> {
        self.check()
    }

    async fn collection_exists(&self, name: &str) -> OlapResult<bool> {
        self.check()?;
        Ok(self.collections.contains_key(name))
    }

    async fn create_collection(&self, name: &str) -> OlapResult<()> {
        self.check()?;
        self.collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> OlapResult<bool> {
        self.check()?;
        Ok(self.collections.remove(name).is_some())
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> OlapResult<Vec<JsonValue>> {
        self.check()?;
        let rows = self
            .collections
            .get(collection)
            .map(|c| c.values())
            .unwrap_or_default();

        let (stages, sink) = pipeline.split_sink();
        let produced = executor::run(stages, rows)?;

        match sink {
            None => Ok(produced),
            Some(Stage::Out { into }) => {
                self.collections
                    .entry(into.clone())
                    .or_default()
                    .replace_rows(produced)?;
                Ok(Vec::new())
            }
            Some(Stage::Merge {
                into,
                on,
                accumulate,
            }) => {
                self.collections
                    .entry(into.clone())
                    .or_default()
                    .merge(produced, on, accumulate);
                Ok(Vec::new())
            }
            Some(other) => Err(OlapError::StorageError(format!(
                "unsupported sink stage {:?}",
                other
            ))),
        }
    }

    async fn find(&self, collection: &str, filter: &Filter) -> OlapResult<Vec<JsonValue>> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| {
                c.rows
                    .values()
                    .filter(|row| filter.matches_value(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_many(&self, collection: &str, rows: Vec<JsonValue>) -> OlapResult<usize> {
        self.check()?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert_rows(rows)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> OlapResult<usize> {
        self.check()?;
        Ok(self
            .collections
            .get_mut(collection)
            .map_or(0, |mut c| c.delete_where(filter)))
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> OlapResult<()> {
        self.check()?;
        let mut target = self.collections.get_mut(collection).ok_or_else(|| {
            OlapError::StorageError(format!("collection '{}' does not exist", collection))
        })?;
        if target.indexes.iter().any(|i| i.name == spec.name) {
            return Ok(());
        }
        if spec.unique {
            Collection::check_unique(spec, &target.rows.values().collect::<Vec<_>>())?;
        }
        target.indexes.push(spec.clone());
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> OlapResult<Vec<IndexSpec>> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn find_metadata(&self, id: &str) -> OlapResult<Option<CubeMetadata>> {
        self.check()?;
        Ok(self.metadata.read().await.get(id).cloned())
    }

    async fn list_metadata(&self) -> OlapResult<Vec<CubeMetadata>> {
        self.check()?;
        Ok(self.metadata.read().await.values().cloned().collect())
    }

    async fn commit(&self, writes: Vec<MetadataWrite>) -> OlapResult<()> {
        self.check()?;
        let mut metadata = self.metadata.write().await;
        let mut staged = metadata.clone();

        for write in writes {
            match write {
                MetadataWrite::Put(record) => {
                    staged.insert(record.id.clone(), record);
                }
                MetadataWrite::SetValid { id, valid } => {
                    let record = staged.get_mut(&id).ok_or_else(|| missing_metadata(&id))?;
                    record.valid = valid;
                }
                MetadataWrite::SetProgress { id, last_processed } => {
                    let record = staged.get_mut(&id).ok_or_else(|| missing_metadata(&id))?;
                    record.last_processed = last_processed;
                    record.valid = true;
                }
                MetadataWrite::Remove { id } => {
                    staged.remove(&id);
                }
            }
        }

        *metadata = staged;
        Ok(())
    }

    async fn load_state(&self) -> OlapResult<Option<CoordinatorState>> {
        self.check()?;
        Ok(self.state.read().await.clone())
    }

    async fn save_state(&self, state: &CoordinatorState) -> OlapResult<()> {
        self.check()?;
        *self.state.write().await = Some(state.clone());
        Ok(())
    }
}

fn missing_metadata(id: &str) -> OlapError {
    OlapError::StorageError(format!("no metadata record for cube '{}'", id))
}
