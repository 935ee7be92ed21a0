/// Filters and aggregate queries.
///
/// This module holds the row filter language used by `Match` stages and
/// collection lookups, plus the request/response types of cube queries and
/// the planner that turns a request into a read-only pipeline over a cube
/// collection.
///
/// # Example
///
/// ```ignore
/// use olap_delta::query::{AggregateRequest, DimensionFilter};
///
/// let request = AggregateRequest::new()
///     .dimension_at("ts", Granularity::Day)
///     .measure("procLength")
///     .filter("ts", DimensionFilter::range(Some(json!(1589288399999u64)), None));
///
/// let rows = coordinator.aggregate("byHour", request).await?;
/// ```
use crate::error::{OlapError, OlapResult};
use crate::model::{Granularity, Model, TimeEncoding};
use crate::pipeline::{
    COUNT_FIELD, CountAccumulator, GroupKey, MeasureAccumulator, NULL_SENTINEL, Pipeline, Stage,
    dimension_field, measure_field, time,
};
use crate::types::{DocumentId, id_to_string};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A filter condition over a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value.
    Eq { field: String, value: JsonValue },
    /// Field greater than or equal to value.
    Gte { field: String, value: JsonValue },
    /// Field less than value.
    Lt { field: String, value: JsonValue },
    /// Field holds one of the document ids, whatever JSON type the id has.
    Ids { field: String, ids: Vec<DocumentId> },
    /// Logical AND of multiple filters. Empty matches every row.
    And(Vec<Filter>),
}

impl Filter {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than-or-equal filter.
    pub fn gte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Match rows whose id field renders to one of `ids`.
    ///
    /// Ids travel through the change feed as strings, so `42` and `"42"`
    /// address the same document.
    pub fn ids(field: impl Into<String>, ids: &[DocumentId]) -> Self {
        Self::Ids {
            field: field.into(),
            ids: ids.to_vec(),
        }
    }

    /// Combine filters with AND.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Evaluate this filter against a JSON value.
    pub fn matches_value(&self, value: &JsonValue) -> bool {
        match self {
            Filter::Eq {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| values_equal(v, expected)),
            Filter::Gte {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| {
                matches!(
                    compare_json(v, expected),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Filter::Lt {
                field,
                value: expected,
            } => get_field(value, field)
                .is_some_and(|v| compare_json(v, expected) == Some(Ordering::Less)),
            Filter::Ids { field, ids } => get_field(value, field).is_some_and(|v| {
                let id = id_to_string(v);
                ids.iter().any(|candidate| *candidate == id)
            }),
            Filter::And(filters) => filters.iter().all(|f| f.matches_value(value)),
        }
    }
}

/// Get a field from a JSON value using dot notation.
pub fn get_field<'a>(value: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for part in field.split('.') {
        match current {
            JsonValue::Object(map) => {
                current = map.get(part)?;
            }
            JsonValue::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a field using dot notation, creating intermediate objects.
///
/// Does nothing if an intermediate value exists and is not an object.
pub fn set_field(target: &mut JsonValue, field: &str, value: JsonValue) {
    let mut current = target;
    let mut parts = field.split('.').peekable();
    while let Some(part) = parts.next() {
        let JsonValue::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

/// Equality with numbers compared by value, so `1` equals `1.0`.
pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(_), JsonValue::Number(_)) => compare_json(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Compare two JSON values of the same kind.
///
/// Values of different kinds are incomparable, so range filters never
/// match across types.
pub fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order over JSON values, used to sort output deterministically.
///
/// Kinds order as null, numbers, strings, booleans, arrays, objects.
pub fn sort_order(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Number(_) => 1,
            JsonValue::String(_) => 2,
            JsonValue::Bool(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }

    match (a, b) {
        (JsonValue::Array(x), JsonValue::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| sort_order(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (JsonValue::Object(_), JsonValue::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| compare_json(a, b).unwrap_or(Ordering::Equal)),
    }
}

/// One requested dimension, optionally re-discretized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DimensionRequestRepr")]
pub struct DimensionRequest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

/// Dimensions may be requested by bare id or as `{id, granularity}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DimensionRequestRepr {
    Id(String),
    Full {
        id: String,
        #[serde(default)]
        granularity: Option<Granularity>,
    },
}

impl From<DimensionRequestRepr> for DimensionRequest {
    fn from(repr: DimensionRequestRepr) -> Self {
        match repr {
            DimensionRequestRepr::Id(id) => Self {
                id,
                granularity: None,
            },
            DimensionRequestRepr::Full { id, granularity } => Self { id, granularity },
        }
    }
}

/// Bounds of a range filter. `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<JsonValue>,
}

/// Filter on one dimension: `{"$range": {"from", "to"}}` or a plain value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionFilter {
    Range {
        #[serde(rename = "$range")]
        range: RangeBounds,
    },
    Equals(JsonValue),
}

impl DimensionFilter {
    pub fn range(from: Option<JsonValue>, to: Option<JsonValue>) -> Self {
        Self::Range {
            range: RangeBounds { from, to },
        }
    }

    pub fn equals(value: impl Into<JsonValue>) -> Self {
        Self::Equals(value.into())
    }
}

/// Output encoding of time dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeFormat {
    /// Epoch milliseconds.
    #[default]
    #[serde(rename = "ms")]
    Millis,
    /// RFC 3339 strings.
    #[serde(rename = "iso")]
    Iso,
}

/// A cube query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    #[serde(default)]
    pub dimensions: Vec<DimensionRequest>,
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, DimensionFilter>,
    #[serde(default)]
    pub time_format: TimeFormat,
}

impl AggregateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group by a dimension at its stored resolution.
    pub fn dimension(mut self, id: impl Into<String>) -> Self {
        self.dimensions.push(DimensionRequest {
            id: id.into(),
            granularity: None,
        });
        self
    }

    /// Group by a time dimension re-discretized to `granularity`.
    pub fn dimension_at(mut self, id: impl Into<String>, granularity: Granularity) -> Self {
        self.dimensions.push(DimensionRequest {
            id: id.into(),
            granularity: Some(granularity),
        });
        self
    }

    /// Sum a measure.
    pub fn measure(mut self, id: impl Into<String>) -> Self {
        self.measures.push(id.into());
        self
    }

    /// Filter on a dimension.
    pub fn filter(mut self, id: impl Into<String>, filter: DimensionFilter) -> Self {
        self.filters.insert(id.into(), filter);
        self
    }

    /// Render time dimensions in `format`.
    pub fn time_format(mut self, format: TimeFormat) -> Self {
        self.time_format = format;
        self
    }
}

/// One result row of a cube query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Map<String, JsonValue>>,
}

/// A validated query against one model.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pipeline: Pipeline,
    time_dimensions: Vec<String>,
    iso: bool,
}

impl QueryPlan {
    /// Validate `request` against `model` and build the read pipeline.
    pub fn build(model: &Model, request: &AggregateRequest) -> OlapResult<Self> {
        for id in &request.measures {
            if model.find_measure(id).is_none() {
                return Err(OlapError::validation(format!("unknown measure '{}'", id)));
            }
        }

        let mut conditions = Vec::new();
        for (id, filter) in &request.filters {
            let dim = model
                .find_dimension(id)
                .ok_or_else(|| OlapError::validation(format!("unknown filter dimension '{}'", id)))?;
            let field = dimension_field(id);
            let coerce = |value: &JsonValue| -> OlapResult<JsonValue> {
                if !dim.is_time() || value.as_str() == Some(NULL_SENTINEL) {
                    return Ok(value.clone());
                }
                time::coerce_bound(value)
                    .map(JsonValue::from)
                    .map_err(OlapError::validation)
            };
            match filter {
                DimensionFilter::Equals(value) => {
                    conditions.push(Filter::eq(field, coerce(value)?));
                }
                DimensionFilter::Range { range } => {
                    if let Some(from) = &range.from {
                        conditions.push(Filter::gte(field.clone(), coerce(from)?));
                    }
                    if let Some(to) = &range.to {
                        conditions.push(Filter::lt(field, coerce(to)?));
                    }
                }
            }
        }

        let mut discretize = Vec::new();
        let mut keys = Vec::new();
        let mut time_dimensions = Vec::new();
        for requested in &request.dimensions {
            let dim = model.find_dimension(&requested.id).ok_or_else(|| {
                OlapError::validation(format!("unknown dimension '{}'", requested.id))
            })?;
            let field = dimension_field(&dim.id);

            if let Some(wanted) = requested.granularity {
                let stored = match (dim.is_time(), dim.granularity) {
                    (true, Some(stored)) => stored,
                    _ => {
                        return Err(OlapError::validation(format!(
                            "dimension '{}' is not a time dimension",
                            dim.id
                        )));
                    }
                };
                if wanted.is_finer_than(stored) {
                    return Err(OlapError::UnsupportedGranularity {
                        granularity: wanted.to_string(),
                        reason: format!(
                            "dimension '{}' is stored at '{}' granularity",
                            dim.id, stored
                        ),
                    });
                }
                if wanted != stored {
                    discretize.push(Stage::Discretize {
                        field: field.clone(),
                        granularity: wanted,
                        encoding: TimeEncoding::Millis,
                    });
                }
            }
            if dim.is_time() {
                time_dimensions.push(dim.id.clone());
            }
            keys.push(GroupKey {
                id: dim.id.clone(),
                field,
            });
        }

        let mut pipeline = Pipeline::new();
        if !conditions.is_empty() {
            pipeline = pipeline.then(Stage::Match(Filter::and(conditions)));
        }
        for stage in discretize {
            pipeline = pipeline.then(stage);
        }
        pipeline = pipeline.then(Stage::Group {
            keys,
            count: CountAccumulator::Sum {
                field: COUNT_FIELD.to_string(),
            },
            measures: request
                .measures
                .iter()
                .map(|id| MeasureAccumulator {
                    id: id.clone(),
                    field: measure_field(id),
                    factor: 1,
                })
                .collect(),
        });

        Ok(Self {
            pipeline,
            time_dimensions,
            iso: request.time_format == TimeFormat::Iso,
        })
    }

    /// The read pipeline to run over the cube collection.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Shape grouped rows into result rows.
    pub fn finish(&self, rows: Vec<JsonValue>) -> Vec<AggregateRow> {
        rows.into_iter()
            .map(|row| {
                let count = get_field(&row, COUNT_FIELD)
                    .and_then(|c| c.as_i64().or_else(|| c.as_f64().map(|f| f as i64)))
                    .unwrap_or(0);
                let d = match row.get("d") {
                    Some(JsonValue::Object(map)) if !map.is_empty() => Some(
                        map.iter()
                            .map(|(id, value)| {
                                let value = if self.time_dimensions.contains(id) {
                                    time::render(value, self.iso)
                                } else {
                                    value.clone()
                                };
                                (id.clone(), value)
                            })
                            .collect(),
                    ),
                    _ => None,
                };
                let m = match row.get("m") {
                    Some(JsonValue::Object(map)) if !map.is_empty() => Some(map.clone()),
                    _ => None,
                };
                AggregateRow { count, d, m }
            })
            .collect()
    }
}
