//! Property indexing module
//!
//! Provides composite B-Tree (and hash-flavoured) indexes over record
//! properties, including key/value indexes over map-valued fields.

pub mod definition;
pub mod manager;
pub mod property_index;

pub use definition::{IndexDefinition, IndexEntry, IndexField, IndexKind, IndexRange, KeyBound, MapIndexBy};
pub use manager::IndexManager;
pub use property_index::PropertyIndex;
