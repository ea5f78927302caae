//! Manager for declared indexes
//!
//! Handles creation, deletion, maintenance on record writes, and scans.

use super::definition::{IndexDefinition, IndexEntry, IndexRange};
use super::property_index::PropertyIndex;
use crate::graph::{Entity, StorageError, StorageResult};
use indexmap::IndexMap;
use std::sync::RwLock;
use tracing::debug;

/// Manager for all indexes of a database, kept in declaration order
#[derive(Debug)]
pub struct IndexManager {
    indexes: RwLock<IndexMap<String, PropertyIndex>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(IndexMap::new()),
        }
    }

    /// Register an index; existing records must be added with [`IndexManager::index_record`]
    pub fn create_index(&self, definition: IndexDefinition) -> StorageResult<()> {
        let mut indexes = self.indexes.write().map_err(|_| StorageError::LockPoisoned)?;
        debug!("Creating index {}", definition);
        indexes
            .entry(definition.name.clone())
            .or_insert_with(|| PropertyIndex::new(definition));
        Ok(())
    }

    /// Drop an index
    pub fn drop_index(&self, name: &str) -> StorageResult<()> {
        let mut indexes = self.indexes.write().map_err(|_| StorageError::LockPoisoned)?;
        indexes
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()))
    }

    /// Definitions declared on any of `classes`, in declaration order
    pub fn definitions_for(&self, classes: &[String]) -> Vec<IndexDefinition> {
        match self.indexes.read() {
            Ok(indexes) => indexes
                .values()
                .filter(|index| classes.contains(&index.definition().class))
                .map(|index| index.definition().clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Add a record to every index declared on one of `hierarchy` (its class and superclasses)
    pub fn index_record(&self, entity: &Entity, hierarchy: &[String]) -> StorageResult<()> {
        let mut indexes = self.indexes.write().map_err(|_| StorageError::LockPoisoned)?;
        for index in indexes.values() {
            if hierarchy.contains(&index.definition().class) {
                for key in index.definition().keys_for(entity) {
                    index.check_unique(&key, entity.rid)?;
                }
            }
        }
        for index in indexes.values_mut() {
            if hierarchy.contains(&index.definition().class) {
                for key in index.definition().keys_for(entity) {
                    index.insert(key, entity.rid);
                }
            }
        }
        Ok(())
    }

    /// Remove a record's keys from every index declared on one of `hierarchy`
    pub fn unindex_record(&self, entity: &Entity, hierarchy: &[String]) -> StorageResult<()> {
        let mut indexes = self.indexes.write().map_err(|_| StorageError::LockPoisoned)?;
        for index in indexes.values_mut() {
            if hierarchy.contains(&index.definition().class) {
                for key in index.definition().keys_for(entity) {
                    index.remove(&key, entity.rid);
                }
            }
        }
        Ok(())
    }

    /// Check if an index exists
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes
            .read()
            .map(|indexes| indexes.contains_key(name))
            .unwrap_or(false)
    }

    pub fn scan(&self, name: &str, range: &IndexRange, ascending: bool) -> StorageResult<Vec<IndexEntry>> {
        let indexes = self.indexes.read().map_err(|_| StorageError::LockPoisoned)?;
        let index = indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()))?;
        index.scan(range, ascending)
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}
