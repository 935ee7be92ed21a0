/// Reference interpreter for pipeline stages.
///
/// Runs the row-producing stages (`Match`, `Project`, `Unwind`,
/// `Discretize`, `Group`) over an in-memory batch. Sink stages are applied
/// by the storage backend, which owns the target collections; see
/// [`merge_rows`] for the accumulate rule they must follow.
use super::{
    COUNT_FIELD, CountAccumulator, GroupKey, MeasureAccumulator, NULL_SENTINEL, Projection, Stage,
    time,
};
use crate::error::{OlapError, OlapResult};
use crate::model::{FieldPath, Granularity, TimeEncoding};
use crate::query::{get_field, set_field, sort_order};
use crate::types::{ID_FIELD, id_to_string};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Run row-producing stages over `rows`.
///
/// Fails with a storage error if a sink stage is passed in, and with an
/// extraction error if a row cannot be discretized.
pub fn run(stages: &[Stage], mut rows: Vec<JsonValue>) -> OlapResult<Vec<JsonValue>> {
    for stage in stages {
        rows = match stage {
            Stage::Match(filter) => rows.into_iter().filter(|r| filter.matches_value(r)).collect(),
            Stage::Project(projections) => rows.iter().map(|r| project(r, projections)).collect(),
            Stage::Unwind { field } => unwind(rows, field),
            Stage::Discretize {
                field,
                granularity,
                encoding,
            } => discretize(rows, field, *granularity, *encoding)?,
            Stage::Group {
                keys,
                count,
                measures,
            } => group(&rows, keys, count, measures),
            Stage::Merge { .. } | Stage::Out { .. } => {
                return Err(OlapError::StorageError(
                    "sink stage must be the last stage of a pipeline".to_string(),
                ));
            }
        };
    }
    Ok(rows)
}

/// Resolve a source path with document-store semantics.
///
/// Traversing an array maps the rest of the path over its elements,
/// dropping elements that are not objects or lack the field.
pub fn resolve_path(document: &JsonValue, path: &FieldPath) -> Option<JsonValue> {
    let names: Vec<&str> = path.names().collect();
    resolve(document, &names)
}

fn resolve(value: &JsonValue, names: &[&str]) -> Option<JsonValue> {
    let Some((first, rest)) = names.split_first() else {
        return Some(value.clone());
    };
    match value {
        JsonValue::Object(map) => map.get(*first).and_then(|v| resolve(v, rest)),
        JsonValue::Array(items) => Some(JsonValue::Array(
            items
                .iter()
                .filter(|item| item.is_object() || item.is_array())
                .filter_map(|item| resolve(item, names))
                .collect(),
        )),
        _ => None,
    }
}

fn project(row: &JsonValue, projections: &[Projection]) -> JsonValue {
    let mut out = JsonValue::Object(Map::new());
    if let Some(id) = row.get(ID_FIELD) {
        set_field(&mut out, ID_FIELD, id.clone());
    }
    for projection in projections {
        if let Some(value) = resolve_path(row, &projection.source) {
            set_field(&mut out, &projection.output, value);
        }
    }
    out
}

fn unwind(rows: Vec<JsonValue>, field: &str) -> Vec<JsonValue> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match get_field(&row, field) {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Array(items)) => {
                for item in items.clone() {
                    let mut expanded = row.clone();
                    set_field(&mut expanded, field, item);
                    out.push(expanded);
                }
            }
            Some(_) => out.push(row),
        }
    }
    out
}

fn discretize(
    rows: Vec<JsonValue>,
    field: &str,
    granularity: Granularity,
    encoding: TimeEncoding,
) -> OlapResult<Vec<JsonValue>> {
    let mut out = Vec::with_capacity(rows.len());
    for mut row in rows {
        let Some(raw) = get_field(&row, field) else {
            out.push(row);
            continue;
        };
        let truncated = if raw.as_str() == Some(NULL_SENTINEL) {
            None
        } else {
            time::discretize(raw, encoding, granularity).map_err(|reason| OlapError::Extraction {
                id: row.get(ID_FIELD).map(id_to_string).unwrap_or_default(),
                reason: format!("{}: {}", field, reason),
            })?
        };
        set_field(&mut row, field, truncated.map_or(JsonValue::Null, JsonValue::from));
        out.push(row);
    }
    Ok(out)
}

/// Running numeric sum that stays integral until a float shows up.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sum {
    Int(i64),
    Float(f64),
}

impl Sum {
    fn add(self, value: &JsonValue, factor: i64) -> Sum {
        let JsonValue::Number(n) = value else {
            return self;
        };
        match (self, n.as_i64()) {
            (Sum::Int(acc), Some(v)) => match v.checked_mul(factor).and_then(|v| acc.checked_add(v)) {
                Some(total) => Sum::Int(total),
                None => Sum::Float(acc as f64 + v as f64 * factor as f64),
            },
            (acc, _) => Sum::Float(acc.as_f64() + n.as_f64().unwrap_or(0.0) * factor as f64),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Sum::Int(v) => v as f64,
            Sum::Float(v) => v,
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Sum::Int(v) => JsonValue::from(v),
            Sum::Float(v) => JsonValue::from(v),
        }
    }
}

/// Add two stored numbers, keeping integers integral.
pub fn add_numbers(a: &JsonValue, b: &JsonValue) -> JsonValue {
    Sum::Int(0).add(a, 1).add(b, 1).into_json()
}

struct Cell {
    key: Vec<JsonValue>,
    count: Sum,
    measures: Vec<Sum>,
}

fn group(
    rows: &[JsonValue],
    keys: &[GroupKey],
    count: &CountAccumulator,
    measures: &[MeasureAccumulator],
) -> Vec<JsonValue> {
    let mut cells: Vec<Cell> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let key: Vec<JsonValue> = keys
            .iter()
            .map(|k| match get_field(row, &k.field) {
                None | Some(JsonValue::Null) => JsonValue::String(NULL_SENTINEL.to_string()),
                Some(value) => value.clone(),
            })
            .collect();
        let slot = *index
            .entry(key_string(key.iter().map(canonical_number)))
            .or_insert_with(|| {
                cells.push(Cell {
                    key,
                    count: Sum::Int(0),
                    measures: vec![Sum::Int(0); measures.len()],
                });
                cells.len() - 1
            });

        let cell = &mut cells[slot];
        cell.count = match count {
            CountAccumulator::Constant(step) => cell.count.add(&JsonValue::from(*step), 1),
            CountAccumulator::Sum { field } => match get_field(row, field) {
                Some(value) => cell.count.add(value, 1),
                None => cell.count,
            },
        };
        for (sum, measure) in cell.measures.iter_mut().zip(measures) {
            if let Some(value) = get_field(row, &measure.field) {
                *sum = sum.add(value, measure.factor);
            }
        }
    }

    cells.sort_by(|a, b| {
        sort_order(
            &JsonValue::Array(a.key.clone()),
            &JsonValue::Array(b.key.clone()),
        )
    });

    cells
        .into_iter()
        .map(|cell| {
            let mut out = Map::new();
            let d: Map<String, JsonValue> = keys.iter().map(|k| k.id.clone()).zip(cell.key).collect();
            out.insert("d".to_string(), JsonValue::Object(d));
            if !measures.is_empty() {
                let m: Map<String, JsonValue> = measures
                    .iter()
                    .map(|m| m.id.clone())
                    .zip(cell.measures.into_iter().map(Sum::into_json))
                    .collect();
                out.insert("m".to_string(), JsonValue::Object(m));
            }
            out.insert(COUNT_FIELD.to_string(), cell.count.into_json());
            JsonValue::Object(out)
        })
        .collect()
}

/// Key of `row` under the merge fields, or `None` if a field is missing.
///
/// Numbers are keyed by value, so `1` and `1.0` land on the same row, and
/// `_id` is keyed by its rendered form, so `42` and `"42"` collide.
pub fn merge_key(row: &JsonValue, on: &[String]) -> Option<String> {
    let parts: Option<Vec<JsonValue>> = on
        .iter()
        .map(|f| {
            get_field(row, f).map(|v| match f.as_str() {
                ID_FIELD => JsonValue::String(id_to_string(v)),
                _ => canonical_number(v),
            })
        })
        .collect();
    parts.map(key_string)
}

fn key_string(parts: impl IntoIterator<Item = JsonValue>) -> String {
    JsonValue::Array(parts.into_iter().collect()).to_string()
}

/// Integral floats within the exact `f64` range collapse to integers.
fn canonical_number(value: &JsonValue) -> JsonValue {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    match value {
        JsonValue::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < EXACT => JsonValue::from(f as i64),
            _ => value.clone(),
        },
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_number).collect()),
        _ => value.clone(),
    }
}

/// Accumulate `incoming` into `existing`, adding every field in `accumulate`.
pub fn merge_rows(existing: &mut JsonValue, incoming: &JsonValue, accumulate: &[String]) {
    for field in accumulate {
        let Some(delta) = get_field(incoming, field) else {
            continue;
        };
        let total = match get_field(existing, field) {
            Some(current) => add_numbers(current, delta),
            None => delta.clone(),
        };
        set_field(existing, field, total);
    }
}
