//! Data session contract consumed by the execution engine
//!
//! The engine never touches storage directly. Everything it needs from the
//! database (transactions, record access, schema lookups, index scans and
//! relation navigation) goes through [`DataSession`].

use super::entity::Entity;
use super::types::{Direction, RecordId};
use crate::index::{IndexDefinition, IndexEntry, IndexRange};
use thiserror::Error;

/// Errors raised by a data session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Class {0} not found")]
    ClassNotFound(String),

    #[error("Class {0} already exists")]
    ClassAlreadyExists(String),

    #[error("Index {0} not found")]
    IndexNotFound(String),

    #[error("Index {0} does not support range scans")]
    RangeNotSupported(String),

    #[error("Duplicate key {key} in unique index {index}")]
    DuplicateKey { index: String, key: String },

    #[error("Concurrent modification of {rid}: stored version {stored}, record version {provided}")]
    ConcurrentModification { rid: RecordId, stored: u64, provided: u64 },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The engine's view of a database session
pub trait DataSession: Send + Sync {
    /// Open a transaction; a no-op when one is already active
    fn begin(&self) -> StorageResult<()>;

    fn commit(&self) -> StorageResult<()>;

    fn rollback(&self) -> StorageResult<()>;

    fn is_tx_active(&self) -> bool;

    /// Number of record operations recorded by the active transaction
    fn tx_entry_count(&self) -> usize;

    fn load(&self, rid: RecordId) -> StorageResult<Option<Entity>>;

    /// Allocate a fresh, not yet saved record of `class`
    fn new_record(&self, class: &str) -> StorageResult<Entity>;

    /// Persist a record, returning the stored copy with its bumped version
    fn save(&self, entity: &Entity) -> StorageResult<Entity>;

    fn delete(&self, rid: RecordId) -> StorageResult<()>;

    fn class_exists(&self, class: &str) -> bool;

    /// True when `class` equals `parent` or inherits from it
    fn is_subclass_of(&self, class: &str, parent: &str) -> bool;

    /// Polymorphic record count of a class
    fn count_class(&self, class: &str) -> StorageResult<usize>;

    /// Polymorphic scan of a class, ordered by record id
    fn scan_class(&self, class: &str, ascending: bool) -> StorageResult<Vec<RecordId>>;

    /// Indexes defined on `class` or inherited from its superclasses, in declaration order
    fn indexes_for_class(&self, class: &str) -> Vec<IndexDefinition>;

    /// Ordered `(key, rid)` entries of an index within `range`
    fn index_scan(&self, index: &str, range: &IndexRange, ascending: bool) -> StorageResult<Vec<IndexEntry>>;

    /// Edges attached to a vertex in `direction`, optionally restricted to an edge class
    fn edges(&self, vertex: RecordId, direction: Direction, edge_class: Option<&str>) -> StorageResult<Vec<RecordId>>;
}
