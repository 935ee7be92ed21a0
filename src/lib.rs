//! # olap-delta
//!
//! Incrementally maintained OLAP cubes over a document store.
//!
//! A cube is a materialized aggregate of one source collection: every
//! source document is flattened into a *shadow row* holding only the paths
//! the cube's model needs, and the shadow rows are grouped into *cells*
//! (one per distinct dimension tuple) carrying a `count` and the sum of
//! every measure. Instead of recomputing cells from scratch, the engine
//! follows the store's change feed and re-derives only the cells touched by
//! the documents that changed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use olap_delta::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let coordinator = Coordinator::new(store.clone(), store.change_log(), OlapConfig::default());
//!
//!     let model = Model::new("db.population")
//!         .dimension(Dimension::new("city", "city")?)
//!         .measure(Measure::new("males", "males")?);
//!     coordinator.create_cube("byCity", model, None, false).await?;
//!
//!     store.insert_document("population", json!({"city": "Lyon", "males": 12})).await?;
//!
//!     // Queries fold in pending changes first.
//!     let rows = coordinator
//!         .aggregate("byCity", AggregateRequest::new().dimension("city").measure("males"))
//!         .await?;
//!     println!("{:?}", rows);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Model** (`model`) - dimensions, measures and time granularities
//! 2. **Pipelines** (`pipeline`) - the model compiled into build, delta and
//!    query pipelines, plus a reference executor
//! 3. **Cube** (`cube`) - one materialized aggregate and its delta cycle
//! 4. **Coordinator** (`coordinator`) - routes change events to cubes and
//!    serializes all updates
//! 5. **Service** (`service`) - request/response surface with graceful drain
//!
//! Storage and the change feed are collaborators behind the
//! [`CubeStorage`] and [`ChangeFeed`] traits; [`MemoryStore`] and
//! [`MemoryChangeLog`] implement both in memory.

pub mod config;
pub mod coordinator;
pub mod cube;
pub mod error;
pub mod feed;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod service;
pub mod storage;
pub mod types;

pub use config::OlapConfig;
pub use coordinator::{Coordinator, UpdateReport};
pub use cube::{Cube, CubeState, DeltaStats};
pub use error::{OlapError, OlapResult};
pub use feed::{ChangeFeed, MemoryChangeLog};
pub use model::{Dimension, FieldPath, Granularity, Measure, Model, TimeEncoding};
pub use query::{AggregateRequest, AggregateRow, DimensionFilter, Filter, TimeFormat};
pub use service::{Request, Response, Service};
pub use storage::{CubeStorage, MemoryStore};
pub use types::{ChangeOp, ChangeRecord, CoordinatorState, CubeMetadata, DocumentId, Watermark};

pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use olap_delta::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::OlapConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{OlapError, OlapResult};
    pub use crate::feed::{ChangeFeed, MemoryChangeLog};
    pub use crate::model::{Dimension, Granularity, Measure, Model, TimeEncoding};
    pub use crate::query::{AggregateRequest, AggregateRow, DimensionFilter, TimeFormat};
    pub use crate::service::{Request, Response, Service};
    pub use crate::storage::{CubeStorage, MemoryStore};
    pub use crate::types::{ChangeRecord, Watermark};
    pub use serde_json::{Value as JsonValue, json};
}
