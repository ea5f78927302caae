//! Tessera query execution engine
//!
//! The execution core of an embedded multi-model (document/graph) database:
//! a pull-based pipeline of composable execution steps, an index access-path
//! planner, and a graph pattern matcher for MATCH statements.
//!
//! # Architecture
//!
//! - `graph`: record model, the `DataSession` contract and an in-memory database
//! - `index`: composite property indexes consumed by the planner
//! - `query::executor`: streams, steps, plans and the SELECT/DML planner
//! - `query::matching`: pattern graphs, traversers and the MATCH planner
//! - `query::cache`: LRU cache of reusable plans
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera::graph::MemoryDatabase;
//! use tessera::query::{QueryEngine, SelectStatement, Statement};
//!
//! let db = Arc::new(MemoryDatabase::new());
//! db.create_vertex_class("Person").unwrap();
//! db.insert_vertex("Person", [("name", "Alice")]).unwrap();
//!
//! let engine = QueryEngine::new(db);
//! let mut ctx = engine.context();
//! let select = Statement::Select(SelectStatement::from_class("Person"));
//! let rows = engine.execute("SELECT FROM Person", &select, &mut ctx).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod graph;
pub mod index;
pub mod query;

// Re-export main types for convenience
pub use config::{ConfigError, EngineConfig};
pub use graph::{DataSession, Entity, MemoryDatabase, PropertyValue, RecordId, StorageError, StorageResult};
pub use query::{ExecutionError, ExecutionResult, QueryEngine, Row, Statement, Value};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
