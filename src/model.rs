/// Dimension/measure models.
///
/// A model is the user-supplied description of a cube: which collection it
/// reads, which document paths become grouping dimensions, and which become
/// summed measures. Models are immutable once a cube is built and are the
/// only thing persisted about a cube's shape; every pipeline is re-derived
/// from them.
///
/// # Paths
///
/// Paths are dot separated. A segment ending in `[]` marks an array-valued
/// field whose elements each contribute a row:
///
/// ```ignore
/// let path: FieldPath = "abilities[].skills[]".parse()?;
/// assert_eq!(path.plain(), "abilities.skills");
/// assert_eq!(path.array_depth(), 2);
/// ```
use crate::error::{OlapError, OlapResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Pattern every cube name, dimension id and measure id must match.
const IDENTIFIER_PATTERN: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> OlapResult<&'static Regex> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTIFIER_PATTERN))
        .as_ref()
        .map_err(|e| OlapError::validation(e.to_string()))
}

/// Check that `value` can be used as an identifier.
pub fn validate_identifier(kind: &str, value: &str) -> OlapResult<()> {
    if identifier_regex()?.is_match(value) {
        Ok(())
    } else {
        Err(OlapError::validation(format!(
            "{} '{}' must match {}",
            kind, value, IDENTIFIER_PATTERN
        )))
    }
}

/// Calendar truncation level of a time dimension, coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Granularity {
    Year,
    Month,
    Day,
    Hour,
}

impl Granularity {
    /// All granularities, coarse to fine.
    pub const ALL: [Granularity; 4] = [
        Granularity::Year,
        Granularity::Month,
        Granularity::Day,
        Granularity::Hour,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Year => "year",
            Granularity::Month => "month",
            Granularity::Day => "day",
            Granularity::Hour => "hour",
        }
    }

    /// Whether `self` is strictly finer than `other`.
    pub fn is_finer_than(&self, other: Granularity) -> bool {
        *self > other
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = OlapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| OlapError::UnsupportedGranularity {
                granularity: s.to_string(),
                reason: "expected one of year, month, day, hour".to_string(),
            })
    }
}

impl TryFrom<String> for Granularity {
    type Error = OlapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How raw time values are encoded in source documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeEncoding {
    /// Epoch milliseconds, as a number or an integer string.
    #[default]
    #[serde(rename = "ms")]
    Millis,
    /// Epoch seconds.
    #[serde(rename = "s")]
    Seconds,
    /// RFC 3339 date-time string.
    #[serde(rename = "iso")]
    Iso,
}

/// Dimension type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionType {
    Time,
}

/// One segment of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    /// Field name
    pub name: String,
    /// Whether the field holds an array whose elements contribute rows
    pub array: bool,
}

/// A parsed dot-separated field path with array markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// Segments of the path.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Path without array markers.
    pub fn plain(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Number of array-valued segments.
    pub fn array_depth(&self) -> usize {
        self.segments.iter().filter(|s| s.array).count()
    }

    /// Segment names, for field resolution.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.name.as_str())
    }
}

impl FromStr for FieldPath {
    type Err = OlapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(OlapError::validation("path must not be empty"));
        }

        let mut segments = Vec::new();
        for raw in s.split('.') {
            let (name, array) = match raw.strip_suffix("[]") {
                Some(name) => (name, true),
                None => (raw, false),
            };
            if name.is_empty() || name.contains("[]") || name.contains('$') {
                return Err(OlapError::validation(format!(
                    "invalid segment '{}' in path '{}'",
                    raw, s
                )));
            }
            segments.push(PathSegment {
                name: name.to_string(),
                array,
            });
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .segments
            .iter()
            .map(|s| {
                if s.array {
                    format!("{}[]", s.name)
                } else {
                    s.name.clone()
                }
            })
            .collect();
        f.write_str(&rendered.join("."))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A grouping dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    /// Source path.
    pub path: FieldPath,
    /// Short unique key.
    pub id: String,
    /// `Some(Time)` for time dimensions.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DimensionType>,
    /// Stored granularity (time dimensions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    /// Encoding of the raw time value (time dimensions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_format: Option<TimeEncoding>,
}

impl Dimension {
    /// Create a plain dimension.
    pub fn new(path: &str, id: impl Into<String>) -> OlapResult<Self> {
        Ok(Self {
            path: path.parse()?,
            id: id.into(),
            kind: None,
            granularity: None,
            time_format: None,
        })
    }

    /// Create a time dimension stored at `granularity`.
    pub fn time(path: &str, id: impl Into<String>, granularity: Granularity) -> OlapResult<Self> {
        Ok(Self {
            path: path.parse()?,
            id: id.into(),
            kind: Some(DimensionType::Time),
            granularity: Some(granularity),
            time_format: None,
        })
    }

    /// Set the encoding of the raw time value.
    pub fn with_time_format(mut self, encoding: TimeEncoding) -> Self {
        self.time_format = Some(encoding);
        self
    }

    pub fn is_time(&self) -> bool {
        self.kind == Some(DimensionType::Time)
    }

    /// Encoding of the raw value, defaulting to milliseconds.
    pub fn encoding(&self) -> TimeEncoding {
        self.time_format.unwrap_or_default()
    }
}

/// A summed measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Source path.
    pub path: FieldPath,
    /// Short unique key.
    pub id: String,
}

impl Measure {
    pub fn new(path: &str, id: impl Into<String>) -> OlapResult<Self> {
        Ok(Self {
            path: path.parse()?,
            id: id.into(),
        })
    }
}

/// A cube model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Source collection, optionally qualified as `database.collection`.
    pub source: String,
    /// Grouping dimensions.
    pub dimensions: Vec<Dimension>,
    /// Summed measures (the count is always present).
    #[serde(default)]
    pub measures: Vec<Measure>,
}

impl Model {
    /// Start a model over `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dimensions: Vec::new(),
            measures: Vec::new(),
        }
    }

    /// Add a dimension.
    pub fn dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    /// Add a measure.
    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    /// The unqualified source collection name.
    pub fn source_collection(&self) -> &str {
        match self.source.find('.') {
            Some(idx) => &self.source[idx + 1..],
            None => &self.source,
        }
    }

    /// Look up a dimension by id.
    pub fn find_dimension(&self, id: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    /// Look up a measure by id.
    pub fn find_measure(&self, id: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.id == id)
    }

    /// Check the model before anything is built from it.
    pub fn validate(&self) -> OlapResult<()> {
        if self.source_collection().is_empty() {
            return Err(OlapError::validation("model source must name a collection"));
        }
        if self.dimensions.is_empty() {
            return Err(OlapError::validation("model needs at least one dimension"));
        }

        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            validate_identifier("dimension id", &dim.id)?;
            if !seen.insert(dim.id.as_str()) {
                return Err(OlapError::validation(format!("duplicate id '{}'", dim.id)));
            }
            match (dim.is_time(), dim.granularity) {
                (true, None) => {
                    return Err(OlapError::UnsupportedGranularity {
                        granularity: String::new(),
                        reason: format!("time dimension '{}' needs a granularity", dim.id),
                    });
                }
                (false, Some(g)) => {
                    return Err(OlapError::validation(format!(
                        "granularity '{}' given for non-time dimension '{}'",
                        g, dim.id
                    )));
                }
                _ => {}
            }
        }
        for measure in &self.measures {
            validate_identifier("measure id", &measure.id)?;
            if !seen.insert(measure.id.as_str()) {
                return Err(OlapError::validation(format!(
                    "duplicate id '{}'",
                    measure.id
                )));
            }
        }

        Ok(())
    }
}
