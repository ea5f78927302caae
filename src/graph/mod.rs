//! Record model and storage collaborators
//!
//! This module holds what the execution engine consumes rather than owns:
//! - record identities, property values and stored entities
//! - the [`DataSession`] contract (transactions, record access, schema, indexes)
//! - [`MemoryDatabase`], an in-memory implementation of that contract

pub mod entity;
pub mod property;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types
pub use entity::{Entity, EntityKind};
pub use property::{PropertyMap, PropertyValue};
pub use session::{DataSession, StorageError, StorageResult};
pub use store::{MemoryDatabase, EDGE_CLASS, VERTEX_CLASS};
pub use types::{Direction, RecordId};
