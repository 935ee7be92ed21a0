/// Common types used throughout olap-delta.
///
/// These are the records that cross module boundaries: positions in the
/// change feed, the mutation records themselves, and the persisted
/// bookkeeping for cubes and the coordinator.
use crate::model::Model;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Identifier of a source document (the `_id` field).
pub type DocumentId = String;

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "_id";

/// A position in the change feed.
///
/// Ordered first by `seconds`, then by `counter`, matching the feed's own
/// ordering primitive. Two events in the same second never share a
/// watermark, so nothing is coalesced the way a plain millisecond clock
/// would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Watermark {
    /// Epoch seconds of the event
    pub seconds: u64,
    /// Tie-breaker within the same second
    pub counter: u32,
}

impl Watermark {
    /// The position before any event.
    pub const ZERO: Watermark = Watermark {
        seconds: 0,
        counter: 0,
    };

    /// Create a watermark from its parts.
    pub fn new(seconds: u64, counter: u32) -> Self {
        Self { seconds, counter }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.counter)
    }
}

/// Kind of mutation recorded in the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// A new document was inserted.
    Insert,
    /// An existing document was modified.
    Update,
    /// A document was removed.
    Delete,
}

/// One mutation event from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Collection the mutation happened in.
    pub namespace: String,
    /// Position of this event in the feed.
    pub watermark: Watermark,
    /// Kind of mutation.
    pub op: ChangeOp,
    /// The inserted document, or the deleted document's key for deletes.
    pub document: Option<JsonValue>,
    /// The addressed document's key for updates.
    pub target: Option<JsonValue>,
}

impl ChangeRecord {
    /// Build an insert record.
    pub fn insert(namespace: impl Into<String>, watermark: Watermark, document: JsonValue) -> Self {
        Self {
            namespace: namespace.into(),
            watermark,
            op: ChangeOp::Insert,
            document: Some(document),
            target: None,
        }
    }

    /// Build an update record addressing `id`.
    pub fn update(namespace: impl Into<String>, watermark: Watermark, id: &str) -> Self {
        Self {
            namespace: namespace.into(),
            watermark,
            op: ChangeOp::Update,
            document: None,
            target: Some(serde_json::json!({ ID_FIELD: id })),
        }
    }

    /// Build a delete record for `id`.
    pub fn delete(namespace: impl Into<String>, watermark: Watermark, id: &str) -> Self {
        Self {
            namespace: namespace.into(),
            watermark,
            op: ChangeOp::Delete,
            document: Some(serde_json::json!({ ID_FIELD: id })),
            target: None,
        }
    }

    /// The affected document id.
    ///
    /// Update records address their document through `target`; inserts and
    /// deletes carry the id inside `document`.
    pub fn entity_id(&self) -> Option<DocumentId> {
        self.target
            .as_ref()
            .and_then(|t| t.get(ID_FIELD))
            .or_else(|| self.document.as_ref().and_then(|d| d.get(ID_FIELD)))
            .map(id_to_string)
    }
}

/// Render a JSON id value as a document id.
pub fn id_to_string(value: &JsonValue) -> DocumentId {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Persisted bookkeeping for one cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeMetadata {
    /// Cube name (unique).
    pub id: String,
    /// The model the cube was built from.
    pub model: Model,
    /// Everything at or before this watermark is folded into the cube.
    pub last_processed: Watermark,
    /// False while a delta is being applied, or after one failed.
    pub valid: bool,
    /// Optional name of the entity the cube is principally about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_entity: Option<String>,
}

/// Persisted coordinator intent, re-applied on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorState {
    /// Whether change buffering should be running.
    pub buffering: bool,
    /// Whether periodic updates should be running.
    pub auto_updating: bool,
    /// Period between automatic updates, in milliseconds.
    pub update_interval_ms: u64,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            buffering: false,
            auto_updating: false,
            update_interval_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_watermark_ordering() {
        let a = Watermark::new(10, 5);
        let b = Watermark::new(10, 6);
        let c = Watermark::new(11, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(Watermark::ZERO < a);
        assert_eq!(a.to_string(), "10:5");
    }

    #[test]
    fn test_entity_id_prefers_target() {
        let update = ChangeRecord::update("c1", Watermark::new(1, 1), "doc-1");
        assert_eq!(update.entity_id().as_deref(), Some("doc-1"));

        let insert = ChangeRecord::insert("c1", Watermark::new(1, 2), json!({"_id": "doc-2", "a": 1}));
        assert_eq!(insert.entity_id().as_deref(), Some("doc-2"));

        let delete = ChangeRecord::delete("c1", Watermark::new(1, 3), "doc-3");
        assert_eq!(delete.entity_id().as_deref(), Some("doc-3"));
    }

    #[test]
    fn test_entity_id_missing() {
        let record = ChangeRecord::insert("c1", Watermark::new(1, 1), json!({"a": 1}));
        assert!(record.entity_id().is_none());
    }

    #[test]
    fn test_numeric_ids_render_as_text() {
        assert_eq!(id_to_string(&json!(42)), "42");
        assert_eq!(id_to_string(&json!("abc")), "abc");
    }
}
