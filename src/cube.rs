/// Cubes: incrementally maintained aggregates over one source collection.
///
/// A cube owns two collections in the storage collaborator, plus one
/// metadata record:
///
/// - **shadow**: one flattened row per source document, holding only the
///   paths the model needs, keyed by the document id
/// - **cube**: the grouped cells `{d, m, count}`
///
/// Deltas never patch numbers in place. For every touched document the
/// cube subtracts the shadow row's contribution, deletes the shadow row,
/// re-extracts it from the current source state and adds it back. The
/// whole cycle is bracketed by `valid=false` / `valid=true` in metadata so
/// an interrupted update is detectable after a restart.
///
/// # Example
///
/// ```ignore
/// let mut cube = Cube::new("byCity", model, "olap", storage.clone())?;
/// cube.init_new(feed.as_ref(), false).await?;
///
/// cube.apply_delta(&["doc-1".to_string()], feed.head().await?).await?;
/// let rows = cube.query(&AggregateRequest::new().measure("males")).await?;
/// ```
use crate::error::{OlapError, OlapResult};
use crate::feed::ChangeFeed;
use crate::model::{Model, validate_identifier};
use crate::pipeline::executor;
use crate::pipeline::{COUNT_FIELD, CompiledModel, DeltaMode, IndexSpec};
use crate::query::{AggregateRequest, AggregateRow, Filter, QueryPlan};
use crate::storage::{CubeStorage, MetadataWrite};
use crate::types::{CubeMetadata, DocumentId, ID_FIELD, Watermark};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of a cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeState {
    /// Configured, nothing materialized yet.
    Uninitialized,
    /// Initial build in progress.
    Building,
    /// Consistent with `last_processed`.
    Valid,
    /// A delta was interrupted or collections are missing; needs a rebuild.
    Invalidated,
    /// Collections and metadata dropped.
    Deleted,
}

/// Summary of one delta cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    /// Distinct source documents reprocessed
    pub entities: usize,
    /// Shadow rows removed
    pub removed: usize,
    /// Shadow rows re-extracted
    pub inserted: usize,
    /// Cells purged after reaching zero
    pub purged: usize,
}

/// A materialized cube.
pub struct Cube {
    name: String,
    compiled: CompiledModel,
    shadow_collection: String,
    cube_collection: String,
    principal_entity: Option<String>,
    last_processed: Watermark,
    state: CubeState,
    storage: Arc<dyn CubeStorage>,
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube")
            .field("name", &self.name)
            .field("source", &self.compiled.model().source)
            .field("last_processed", &self.last_processed)
            .field("state", &self.state)
            .finish()
    }
}

impl Cube {
    /// Configure a cube. Fails on a bad name or model before touching storage.
    pub fn new(
        name: impl Into<String>,
        model: Model,
        prefix: &str,
        storage: Arc<dyn CubeStorage>,
    ) -> OlapResult<Self> {
        let name = name.into();
        validate_identifier("cube name", &name)?;
        let compiled = CompiledModel::compile(&model)?;
        let base = format!("{}_{}_{}", prefix, model.source_collection(), name);

        Ok(Self {
            shadow_collection: format!("{}_shadow", base),
            cube_collection: format!("{}_cube", base),
            name,
            compiled,
            principal_entity: None,
            last_processed: Watermark::ZERO,
            state: CubeState::Uninitialized,
            storage,
        })
    }

    /// Configure a cube from its persisted record.
    pub fn from_metadata(
        metadata: &CubeMetadata,
        prefix: &str,
        storage: Arc<dyn CubeStorage>,
    ) -> OlapResult<Self> {
        let mut cube = Self::new(metadata.id.clone(), metadata.model.clone(), prefix, storage)?;
        cube.principal_entity = metadata.principal_entity.clone();
        cube.last_processed = metadata.last_processed;
        Ok(cube)
    }

    /// Set the entity the cube is principally about.
    pub fn with_principal_entity(mut self, entity: Option<String>) -> Self {
        self.principal_entity = entity;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Model {
        self.compiled.model()
    }

    /// Namespace of the source collection in the change feed.
    pub fn source_namespace(&self) -> &str {
        self.compiled.model().source_collection()
    }

    pub fn shadow_collection(&self) -> &str {
        &self.shadow_collection
    }

    pub fn cube_collection(&self) -> &str {
        &self.cube_collection
    }

    pub fn last_processed(&self) -> Watermark {
        self.last_processed
    }

    pub fn state(&self) -> CubeState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == CubeState::Valid
    }

    /// The metadata record describing the cube's current state.
    pub fn metadata(&self) -> CubeMetadata {
        CubeMetadata {
            id: self.name.clone(),
            model: self.compiled.model().clone(),
            last_processed: self.last_processed,
            valid: self.is_valid(),
            principal_entity: self.principal_entity.clone(),
        }
    }

    /// Materialize the cube from a full scan of the source.
    ///
    /// The feed head is captured before scanning, so anything written
    /// during the scan is replayed by a later delta. With `skip_build` the
    /// collections are created empty.
    pub async fn init_new(&mut self, feed: &dyn ChangeFeed, skip_build: bool) -> OlapResult<()> {
        self.state = CubeState::Building;
        match self.build(feed, skip_build).await {
            Ok(watermark) => {
                self.last_processed = watermark;
                self.state = CubeState::Valid;
                info!(cube = %self.name, %watermark, skip_build, "cube built");
                Ok(())
            }
            Err(e) => {
                self.state = CubeState::Uninitialized;
                warn!(cube = %self.name, error = %e, "cube build failed");
                Err(e)
            }
        }
    }

    async fn build(&self, feed: &dyn ChangeFeed, skip_build: bool) -> OlapResult<Watermark> {
        let watermark = feed.head().await?;
        let source = self.source_namespace();

        for collection in [&self.shadow_collection, &self.cube_collection] {
            self.storage.drop_collection(collection).await?;
            self.storage.create_collection(collection).await?;
        }

        if !skip_build {
            self.storage
                .aggregate(source, &self.compiled.build_shadow_pipeline(&self.shadow_collection))
                .await?;
            self.storage
                .aggregate(
                    &self.shadow_collection,
                    &self.compiled.build_cube_pipeline(&self.cube_collection),
                )
                .await?;
        }

        self.storage
            .create_index(
                &self.shadow_collection,
                &IndexSpec {
                    name: "source_id".to_string(),
                    fields: vec![ID_FIELD.to_string()],
                    unique: true,
                },
            )
            .await?;
        for index in self.compiled.indexes() {
            self.storage.create_index(&self.cube_collection, index).await?;
        }

        let mut metadata = self.metadata();
        metadata.last_processed = watermark;
        metadata.valid = true;
        self.storage.commit(vec![MetadataWrite::Put(metadata)]).await?;

        Ok(watermark)
    }

    /// Attach to existing collections without rebuilding.
    ///
    /// Marks the cube invalid in metadata if either collection is missing.
    pub async fn load(&mut self) -> OlapResult<()> {
        for collection in [&self.shadow_collection, &self.cube_collection] {
            if !self.storage.collection_exists(collection).await? {
                self.state = CubeState::Invalidated;
                self.storage
                    .commit(vec![MetadataWrite::SetValid {
                        id: self.name.clone(),
                        valid: false,
                    }])
                    .await?;
                return Err(OlapError::inconsistent(
                    &self.name,
                    format!("collection '{}' is missing", collection),
                ));
            }
        }

        self.state = CubeState::Valid;
        debug!(cube = %self.name, watermark = %self.last_processed, "cube loaded");
        Ok(())
    }

    fn ensure_valid(&self) -> OlapResult<()> {
        match self.state {
            CubeState::Valid => Ok(()),
            state => Err(OlapError::inconsistent(
                &self.name,
                format!("cube is {:?}", state),
            )),
        }
    }

    /// Fold the current state of `ids` into the cube.
    ///
    /// Extraction is checked before anything is written: if any document
    /// cannot be turned into cells the batch is rejected, the watermark
    /// stays put and the cube stays valid. A failure after writing began
    /// leaves the cube invalid.
    pub async fn apply_delta(&mut self, ids: &[DocumentId], watermark: Watermark) -> OlapResult<DeltaStats> {
        self.ensure_valid()?;

        let ids: Vec<DocumentId> = ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        if ids.is_empty() {
            return Ok(DeltaStats::default());
        }

        let fresh = self
            .storage
            .aggregate(self.source_namespace(), &self.compiled.shadow_pipeline(Some(&ids)))
            .await?;
        executor::run(
            &self.compiled.cells_pipeline(DeltaMode::Insert).stages,
            fresh.clone(),
        )?;

        self.storage
            .commit(vec![MetadataWrite::SetValid {
                id: self.name.clone(),
                valid: false,
            }])
            .await?;
        self.state = CubeState::Invalidated;

        let stats = self.rewrite(&ids, fresh).await?;

        let watermark = self.last_processed.max(watermark);
        self.storage
            .commit(vec![MetadataWrite::SetProgress {
                id: self.name.clone(),
                last_processed: watermark,
            }])
            .await?;
        self.last_processed = watermark;
        self.state = CubeState::Valid;

        debug!(
            cube = %self.name,
            %watermark,
            entities = stats.entities,
            removed = stats.removed,
            inserted = stats.inserted,
            purged = stats.purged,
            "delta applied"
        );
        Ok(stats)
    }

    async fn rewrite(&self, ids: &[DocumentId], fresh: Vec<JsonValue>) -> OlapResult<DeltaStats> {
        let by_id = Filter::ids(ID_FIELD, ids);

        self.storage
            .aggregate(
                &self.shadow_collection,
                &self.compiled.delta_pipeline(ids, DeltaMode::Delete, &self.cube_collection),
            )
            .await?;
        let removed = self.storage.delete_many(&self.shadow_collection, &by_id).await?;

        let inserted = self.storage.insert_many(&self.shadow_collection, fresh).await?;
        self.storage
            .aggregate(
                &self.shadow_collection,
                &self.compiled.delta_pipeline(ids, DeltaMode::Insert, &self.cube_collection),
            )
            .await?;

        let purged = self
            .storage
            .delete_many(&self.cube_collection, &Filter::eq(COUNT_FIELD, 0))
            .await?;

        Ok(DeltaStats {
            entities: ids.len(),
            removed,
            inserted,
            purged,
        })
    }

    /// Run a read-only aggregate over the cells.
    pub async fn query(&self, request: &AggregateRequest) -> OlapResult<Vec<AggregateRow>> {
        self.ensure_valid()?;
        let plan = QueryPlan::build(self.compiled.model(), request)?;
        let rows = self
            .storage
            .aggregate(&self.cube_collection, plan.pipeline())
            .await?;
        Ok(plan.finish(rows))
    }

    /// Raw cells, in storage order.
    pub async fn cells(&self) -> OlapResult<Vec<JsonValue>> {
        self.storage
            .find(&self.cube_collection, &Filter::and(Vec::new()))
            .await
    }

    /// Raw shadow rows, in storage order.
    pub async fn shadow_rows(&self) -> OlapResult<Vec<JsonValue>> {
        self.storage
            .find(&self.shadow_collection, &Filter::and(Vec::new()))
            .await
    }

    /// Drop the cube's collections and metadata.
    pub async fn delete(&mut self) -> OlapResult<()> {
        self.storage.drop_collection(&self.shadow_collection).await?;
        self.storage.drop_collection(&self.cube_collection).await?;
        self.storage
            .commit(vec![MetadataWrite::Remove {
                id: self.name.clone(),
            }])
            .await?;
        self.state = CubeState::Deleted;
        info!(cube = %self.name, "cube deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimension, Measure};
    use crate::storage::MemoryStore;
    use serde_json::json;

    async fn create_test_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (i, (m, f)) in [(1, 2), (10, 20), (100, 200), (1000, 2000)].into_iter().enumerate() {
            store
                .insert_document(
                    "c1",
                    json!({"_id": format!("city-{}", i), "c": format!("City {}", i), "m": m, "f": f}),
                )
                .await
                .unwrap();
        }
        store
    }

    fn city_model() -> Model {
        Model::new("db1.c1")
            .dimension(Dimension::new("c", "city").unwrap())
            .measure(Measure::new("m", "males").unwrap())
            .measure(Measure::new("f", "females").unwrap())
    }

    async fn built_cube(store: &Arc<MemoryStore>) -> Cube {
        let mut cube = Cube::new("main", city_model(), "olap", store.clone()).unwrap();
        cube.init_new(store.change_log().as_ref(), false).await.unwrap();
        cube
    }

    #[tokio::test]
    async fn test_collection_names() {
        let store = create_test_store().await;
        let cube = Cube::new("main", city_model(), "olap", store).unwrap();
        assert_eq!(cube.shadow_collection(), "olap_c1_main_shadow");
        assert_eq!(cube.cube_collection(), "olap_c1_main_cube");
        assert_eq!(cube.state(), CubeState::Uninitialized);
    }

    #[tokio::test]
    async fn test_init_new_builds_and_persists() {
        let store = create_test_store().await;
        let cube = built_cube(&store).await;

        assert!(cube.is_valid());
        assert_eq!(cube.last_processed(), store.change_log().head().await.unwrap());
        assert_eq!(store.count(cube.shadow_collection()), 4);
        assert_eq!(store.count(cube.cube_collection()), 4);

        let metadata = store.find_metadata("main").await.unwrap().unwrap();
        assert!(metadata.valid);
        assert_eq!(metadata.last_processed, cube.last_processed());
    }

    #[tokio::test]
    async fn test_total_over_all_cities() {
        let store = create_test_store().await;
        let cube = built_cube(&store).await;

        let rows = cube
            .query(&AggregateRequest::new().measure("males").measure("females"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 4);
        assert_eq!(
            serde_json::to_value(&rows[0].m).unwrap(),
            json!({"males": 1111, "females": 2222})
        );
        assert!(rows[0].d.is_none());
    }

    #[tokio::test]
    async fn test_skip_build_leaves_cube_empty() {
        let store = create_test_store().await;
        let mut cube = Cube::new("main", city_model(), "olap", store.clone()).unwrap();
        cube.init_new(store.change_log().as_ref(), true).await.unwrap();

        assert!(cube.is_valid());
        assert_eq!(store.count(cube.cube_collection()), 0);
        assert!(store.collection_exists(cube.shadow_collection()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_then_delta_matches_rebuild() {
        let store = create_test_store().await;
        let mut cube = built_cube(&store).await;

        store.delete_document("c1", "city-2").await.unwrap();
        let head = store.change_log().head().await.unwrap();
        let stats = cube.apply_delta(&["city-2".to_string()], head).await.unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.purged, 1);
        assert_eq!(cube.last_processed(), head);

        let mut fresh = Cube::new("fresh", city_model(), "olap", store.clone()).unwrap();
        fresh.init_new(store.change_log().as_ref(), false).await.unwrap();
        assert_eq!(cube.cells().await.unwrap().len(), 3);
        assert_eq!(cube.query(&AggregateRequest::new().dimension("city").measure("males")).await.unwrap(),
            fresh.query(&AggregateRequest::new().dimension("city").measure("males")).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_moves_contribution() {
        let store = create_test_store().await;
        let mut cube = built_cube(&store).await;

        store
            .replace_document("c1", "city-0", json!({"c": "City 1", "m": 5, "f": 5}))
            .await
            .unwrap();
        let head = store.change_log().head().await.unwrap();
        cube.apply_delta(&["city-0".to_string(), "city-0".to_string()], head)
            .await
            .unwrap();

        let rows = cube
            .query(&AggregateRequest::new().dimension("city").measure("males"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].d.as_ref().unwrap()["city"], json!("City 1"));
        assert_eq!(rows[0].count, 2);
        assert_eq!(rows[0].m.as_ref().unwrap()["males"], json!(15));
    }

    #[tokio::test]
    async fn test_extraction_failure_aborts_before_writing() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_document("c3", json!({"_id": "a", "t": 1589288400000i64, "p": 1}))
            .await
            .unwrap();
        let model = Model::new("c3")
            .dimension(Dimension::time("t", "ts", crate::model::Granularity::Hour).unwrap())
            .measure(Measure::new("p", "p").unwrap());
        let mut cube = Cube::new("times", model, "olap", store.clone()).unwrap();
        cube.init_new(store.change_log().as_ref(), false).await.unwrap();
        let before = cube.last_processed();

        store
            .replace_document("c3", "a", json!({"t": "not a time", "p": 2}))
            .await
            .unwrap();
        let head = store.change_log().head().await.unwrap();
        let err = cube.apply_delta(&["a".to_string()], head).await.unwrap_err();

        assert!(matches!(err, OlapError::Extraction { .. }));
        assert!(cube.is_valid());
        assert_eq!(cube.last_processed(), before);
        assert!(store.find_metadata("times").await.unwrap().unwrap().valid);
        assert_eq!(cube.cells().await.unwrap()[0]["count"], json!(1));
    }

    #[tokio::test]
    async fn test_storage_failure_mid_delta_invalidates() {
        let store = create_test_store().await;
        let mut cube = built_cube(&store).await;

        store.delete_document("c1", "city-1").await.unwrap();
        let head = store.change_log().head().await.unwrap();
        // Extraction read and the invalidating commit succeed, then storage drops.
        store.fail_after(2);
        let err = cube.apply_delta(&["city-1".to_string()], head).await.unwrap_err();
        store.set_available(true);

        assert!(matches!(err, OlapError::StorageUnavailable(_)));
        assert_eq!(cube.state(), CubeState::Invalidated);
        assert!(!store.find_metadata("main").await.unwrap().unwrap().valid);
        assert!(matches!(
            cube.query(&AggregateRequest::new()).await,
            Err(OlapError::InconsistentCube { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_collection_marks_invalid() {
        let store = create_test_store().await;
        let cube = built_cube(&store).await;
        let metadata = cube.metadata();
        store.drop_collection(cube.cube_collection()).await.unwrap();

        let mut loaded = Cube::from_metadata(&metadata, "olap", store.clone()).unwrap();
        let err = loaded.load().await.unwrap_err();
        assert!(matches!(err, OlapError::InconsistentCube { .. }));
        assert!(!store.find_metadata("main").await.unwrap().unwrap().valid);
    }

    #[tokio::test]
    async fn test_delete_drops_everything() {
        let store = create_test_store().await;
        let mut cube = built_cube(&store).await;
        cube.delete().await.unwrap();

        assert_eq!(cube.state(), CubeState::Deleted);
        assert!(!store.collection_exists(cube.cube_collection()).await.unwrap());
        assert!(store.find_metadata("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_cube_name() {
        let store = create_test_store().await;
        assert!(Cube::new("bad name", city_model(), "olap", store).is_err());
    }
}
