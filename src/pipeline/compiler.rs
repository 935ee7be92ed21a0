/// Model compiler.
///
/// Turns a [`Model`] into the artifacts a cube needs: the shadow projection,
/// the expansion plan (one unwind per array marker, dimensions before
/// measures, declaration order), time discretizations, the group key, the
/// signed delta aggregations, the merge keys and the index specs.
///
/// Compilation does no I/O and is deterministic:
///
/// ```ignore
/// let a = CompiledModel::compile(&model)?;
/// let b = CompiledModel::compile(&model)?;
/// assert_eq!(a.cells_pipeline(DeltaMode::Insert), b.cells_pipeline(DeltaMode::Insert));
/// ```
use super::{
    COUNT_FIELD, CountAccumulator, GroupKey, MeasureAccumulator, Pipeline, Projection, Stage,
    dimension_field, measure_field,
};
use crate::error::OlapResult;
use crate::model::{Granularity, Model, TimeEncoding};
use crate::query::Filter;
use crate::types::{DocumentId, ID_FIELD};
use serde::{Deserialize, Serialize};

/// Direction of a delta aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    /// Add the rows' contribution.
    Insert,
    /// Subtract the rows' contribution.
    Delete,
}

impl DeltaMode {
    pub fn sign(&self) -> i64 {
        match self {
            DeltaMode::Insert => 1,
            DeltaMode::Delete => -1,
        }
    }
}

/// An index to create on the cube collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

/// Everything derived from a model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    model: Model,
    shadow_projection: Vec<Projection>,
    expansion: Vec<String>,
    discretizations: Vec<(String, Granularity, TimeEncoding)>,
    group_keys: Vec<GroupKey>,
    measures: Vec<(String, String)>,
    merge_keys: Vec<String>,
    indexes: Vec<IndexSpec>,
}

impl CompiledModel {
    /// Compile a model. Fails on an invalid model before anything is built.
    pub fn compile(model: &Model) -> OlapResult<Self> {
        model.validate()?;

        let mut shadow_projection = Vec::new();
        let mut expansion = Vec::new();
        let mut discretizations = Vec::new();
        let mut group_keys = Vec::new();
        let mut merge_keys = Vec::new();

        for dim in &model.dimensions {
            let field = dimension_field(&dim.id);
            shadow_projection.push(Projection {
                output: field.clone(),
                source: dim.path.clone(),
            });
            for _ in 0..dim.path.array_depth() {
                expansion.push(field.clone());
            }
            if let (true, Some(granularity)) = (dim.is_time(), dim.granularity) {
                discretizations.push((field.clone(), granularity, dim.encoding()));
            }
            group_keys.push(GroupKey {
                id: dim.id.clone(),
                field: field.clone(),
            });
            merge_keys.push(field);
        }

        let mut measures = Vec::new();
        for measure in &model.measures {
            let field = measure_field(&measure.id);
            shadow_projection.push(Projection {
                output: field.clone(),
                source: measure.path.clone(),
            });
            for _ in 0..measure.path.array_depth() {
                expansion.push(field.clone());
            }
            measures.push((measure.id.clone(), field));
        }

        let mut indexes = vec![IndexSpec {
            name: "cell_key".to_string(),
            fields: merge_keys.clone(),
            unique: true,
        }];
        if merge_keys.len() > 1 {
            for (dim, field) in model.dimensions.iter().zip(&merge_keys) {
                indexes.push(IndexSpec {
                    name: format!("d_{}", dim.id),
                    fields: vec![field.clone()],
                    unique: false,
                });
            }
        }

        Ok(Self {
            model: model.clone(),
            shadow_projection,
            expansion,
            discretizations,
            group_keys,
            measures,
            merge_keys,
            indexes,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Shadow row layout: output slot to source path.
    pub fn shadow_projection(&self) -> &[Projection] {
        &self.shadow_projection
    }

    /// Unwound fields, one entry per array marker.
    pub fn expansion(&self) -> &[String] {
        &self.expansion
    }

    /// Keys identifying a cell.
    pub fn merge_keys(&self) -> &[String] {
        &self.merge_keys
    }

    /// Fields added together when a row merges into an existing cell.
    pub fn accumulated_fields(&self) -> Vec<String> {
        std::iter::once(COUNT_FIELD.to_string())
            .chain(self.measures.iter().map(|(_, field)| field.clone()))
            .collect()
    }

    /// Indexes of the cube collection: a unique index over every
    /// dimension, plus one lookup index per dimension when there are
    /// several.
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Project source documents into shadow rows, optionally restricted to `ids`.
    pub fn shadow_pipeline(&self, ids: Option<&[DocumentId]>) -> Pipeline {
        let mut pipeline = Pipeline::new();
        if let Some(ids) = ids {
            pipeline = pipeline.then(match_ids(ids));
        }
        pipeline.then(Stage::Project(self.shadow_projection.clone()))
    }

    /// Expand, discretize and group shadow rows into signed cells.
    pub fn cells_pipeline(&self, mode: DeltaMode) -> Pipeline {
        let mut pipeline = Pipeline::new();
        for field in &self.expansion {
            pipeline = pipeline.then(Stage::Unwind {
                field: field.clone(),
            });
        }
        for (field, granularity, encoding) in &self.discretizations {
            pipeline = pipeline.then(Stage::Discretize {
                field: field.clone(),
                granularity: *granularity,
                encoding: *encoding,
            });
        }
        pipeline.then(Stage::Group {
            keys: self.group_keys.clone(),
            count: CountAccumulator::Constant(mode.sign()),
            measures: self
                .measures
                .iter()
                .map(|(id, field)| MeasureAccumulator {
                    id: id.clone(),
                    field: field.clone(),
                    factor: mode.sign(),
                })
                .collect(),
        })
    }

    /// Full build of the shadow collection from the source collection.
    pub fn build_shadow_pipeline(&self, shadow: &str) -> Pipeline {
        self.shadow_pipeline(None).then(Stage::Out {
            into: shadow.to_string(),
        })
    }

    /// Full build of the cube collection from the shadow collection.
    pub fn build_cube_pipeline(&self, cube: &str) -> Pipeline {
        self.cells_pipeline(DeltaMode::Insert).then(Stage::Out {
            into: cube.to_string(),
        })
    }

    /// Merge the signed contribution of the shadow rows for `ids` into `cube`.
    pub fn delta_pipeline(&self, ids: &[DocumentId], mode: DeltaMode, cube: &str) -> Pipeline {
        Pipeline::new()
            .then(match_ids(ids))
            .chain(self.cells_pipeline(mode))
            .then(Stage::Merge {
                into: cube.to_string(),
                on: self.merge_keys.clone(),
                accumulate: self.accumulated_fields(),
            })
    }
}

fn match_ids(ids: &[DocumentId]) -> Stage {
    Stage::Match(Filter::ids(ID_FIELD, ids))
}
