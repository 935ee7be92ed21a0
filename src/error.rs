/// Error types for olap-delta operations.
///
/// Every failure mode of the cube engine maps onto one variant here, so
/// callers (and the service layer) can tell a bad request apart from a cube
/// that needs rebuilding or a collaborator that went away.
use thiserror::Error;

/// The main error type for olap-delta operations.
///
/// All fallible operations return `Result<T, OlapError>`.
#[derive(Error, Debug)]
pub enum OlapError {
    /// Malformed request or model (unknown id, missing field, bad identifier).
    ///
    /// Always recoverable at the request boundary; never touches persisted state.
    #[error("Invalid request: {reason}")]
    Validation {
        /// Description of what was wrong
        reason: String,
    },

    /// The cube's metadata says `valid=false` or its collections are missing.
    #[error("Cube '{cube}' is inconsistent: {reason}")]
    InconsistentCube {
        /// Name of the affected cube
        cube: String,
        /// Why the cube cannot be used
        reason: String,
    },

    /// The storage collaborator could not be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The change-feed subscription broke or the feed could not be read.
    #[error("Change feed subscription failed: {0}")]
    FeedSubscription(String),

    /// A cube with this name is already live.
    #[error("Cube '{name}' already exists")]
    DuplicateCube {
        /// The conflicting cube name
        name: String,
    },

    /// Unknown granularity token, or a granularity finer than the stored one.
    #[error("Unsupported granularity '{granularity}': {reason}")]
    UnsupportedGranularity {
        /// The offending granularity token
        granularity: String,
        /// Why it was rejected
        reason: String,
    },

    /// No live cube with this name.
    #[error("Cube '{name}' not found")]
    CubeNotFound {
        /// The requested cube name
        name: String,
    },

    /// A source document could not be turned into cube rows.
    #[error("Cannot extract document '{id}': {reason}")]
    Extraction {
        /// Source document id
        id: String,
        /// What failed during extraction
        reason: String,
    },

    /// The process is shutting down and no longer accepts work.
    #[error("Shutting down, request rejected")]
    ShuttingDown,

    /// Storage operation failed (constraint violation, missing collection, I/O).
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl OlapError {
    /// Shorthand for a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for an inconsistent-cube error.
    pub fn inconsistent(cube: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InconsistentCube {
            cube: cube.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code, used in service responses.
    pub fn code(&self) -> &'static str {
        match self {
            OlapError::Validation { .. } => "validation",
            OlapError::InconsistentCube { .. } => "inconsistent_cube",
            OlapError::StorageUnavailable(_) => "storage_unavailable",
            OlapError::FeedSubscription(_) => "feed_subscription",
            OlapError::DuplicateCube { .. } => "duplicate_cube",
            OlapError::UnsupportedGranularity { .. } => "unsupported_granularity",
            OlapError::CubeNotFound { .. } => "cube_not_found",
            OlapError::Extraction { .. } => "extraction",
            OlapError::ShuttingDown => "shutting_down",
            OlapError::StorageError(_) => "storage",
            OlapError::SerializationError(_) => "serialization",
        }
    }

    /// Whether retrying the same operation later may succeed without
    /// any change to the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OlapError::StorageUnavailable(_) | OlapError::FeedSubscription(_)
        )
    }
}

/// Result type alias for olap-delta operations.
pub type OlapResult<T> = Result<T, OlapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_per_class() {
        assert_eq!(OlapError::validation("x").code(), "validation");
        assert_eq!(OlapError::inconsistent("c", "r").code(), "inconsistent_cube");
        assert_eq!(OlapError::ShuttingDown.code(), "shutting_down");
        assert_eq!(
            OlapError::DuplicateCube {
                name: "main".into()
            }
            .code(),
            "duplicate_cube"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(OlapError::StorageUnavailable("down".into()).is_transient());
        assert!(OlapError::FeedSubscription("lagged".into()).is_transient());
        assert!(!OlapError::validation("bad").is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = OlapError::inconsistent("main", "shadow collection missing");
        assert_eq!(
            err.to_string(),
            "Cube 'main' is inconsistent: shadow collection missing"
        );
    }
}
