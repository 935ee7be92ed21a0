/// Cube pipelines.
///
/// A model compiles into an explicit intermediate representation: an
/// ordered list of typed stages. The compiler is pure and deterministic, so
/// the same model always yields the same stages; only the model is ever
/// persisted. Stages are interpreted by [`executor`], which the in-memory
/// store uses directly and which other storage backends can mirror.
///
/// # Stages
///
/// - `Match`: keep rows satisfying a filter
/// - `Project`: copy source paths into `d.<id>` / `m.<id>` slots
/// - `Unwind`: one output row per element of an array field
/// - `Discretize`: truncate a time field to a granularity
/// - `Group`: collapse rows into cells, summing count and measures
/// - `Merge`: insert-or-accumulate rows into a collection (sink)
/// - `Out`: replace a collection with the rows (sink)
pub mod compiler;
pub mod executor;
pub mod time;

pub use compiler::{CompiledModel, DeltaMode, IndexSpec};

use crate::model::{FieldPath, Granularity, TimeEncoding};
use crate::query::Filter;
use serde::{Deserialize, Serialize};

/// Grouping key value for missing or null dimensions.
pub const NULL_SENTINEL: &str = "__null__";

/// Name of the per-cell row counter.
pub const COUNT_FIELD: &str = "count";

/// Output slot of a dimension inside shadow rows and cells.
pub fn dimension_field(id: &str) -> String {
    format!("d.{}", id)
}

/// Output slot of a measure inside shadow rows and cells.
pub fn measure_field(id: &str) -> String {
    format!("m.{}", id)
}

/// One projected field: `output` receives the value at `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub output: String,
    pub source: FieldPath,
}

/// One grouping key of a `Group` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    /// Dimension id in the output cell
    pub id: String,
    /// Row field holding the value
    pub field: String,
}

/// How the cell count is accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CountAccumulator {
    /// Add a constant per row (+1 on insert, -1 on delete).
    Constant(i64),
    /// Sum an existing count field (re-grouping cells).
    Sum { field: String },
}

/// One summed measure of a `Group` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureAccumulator {
    /// Measure id in the output cell
    pub id: String,
    /// Row field holding the value
    pub field: String,
    /// Multiplier applied to every value (1 or -1)
    pub factor: i64,
}

/// A single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    Match(Filter),
    Project(Vec<Projection>),
    Unwind {
        field: String,
    },
    Discretize {
        field: String,
        granularity: Granularity,
        encoding: TimeEncoding,
    },
    Group {
        keys: Vec<GroupKey>,
        count: CountAccumulator,
        measures: Vec<MeasureAccumulator>,
    },
    Merge {
        into: String,
        on: Vec<String>,
        accumulate: Vec<String>,
    },
    Out {
        into: String,
    },
}

impl Stage {
    /// Whether the stage writes into a collection instead of producing rows.
    pub fn is_sink(&self) -> bool {
        matches!(self, Stage::Merge { .. } | Stage::Out { .. })
    }
}

/// An ordered list of stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn then(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append all stages of `other`.
    pub fn chain(mut self, other: Pipeline) -> Self {
        self.stages.extend(other.stages);
        self
    }

    /// Split off a trailing sink stage, if any.
    pub fn split_sink(&self) -> (&[Stage], Option<&Stage>) {
        match self.stages.split_last() {
            Some((last, rest)) if last.is_sink() => (rest, Some(last)),
            _ => (&self.stages, None),
        }
    }
}
