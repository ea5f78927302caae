//! B-Tree based composite index
//!
//! Keys are ordered lists of property values. Hash indexes share the same
//! structure; the planner simply never asks them for range scans.

use super::definition::{IndexDefinition, IndexEntry, IndexRange, KeyBound};
use crate::graph::{PropertyValue, RecordId, StorageError, StorageResult};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Entries of one declared index
#[derive(Debug, Clone)]
pub struct PropertyIndex {
    definition: IndexDefinition,
    /// Key -> records carrying it
    entries: BTreeMap<Vec<PropertyValue>, BTreeSet<RecordId>>,
}

impl PropertyIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Fails when a unique index already maps `key` to another record
    pub fn check_unique(&self, key: &[PropertyValue], rid: RecordId) -> StorageResult<()> {
        if !self.definition.is_unique() {
            return Ok(());
        }
        match self.entries.get(key) {
            Some(rids) if rids.iter().any(|r| *r != rid) => Err(StorageError::DuplicateKey {
                index: self.definition.name.clone(),
                key: format!("{:?}", key),
            }),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, key: Vec<PropertyValue>, rid: RecordId) {
        self.entries.entry(key).or_default().insert(rid);
    }

    pub fn remove(&mut self, key: &[PropertyValue], rid: RecordId) {
        if let Some(rids) = self.entries.get_mut(key) {
            rids.remove(&rid);
            if rids.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    pub fn get(&self, key: &[PropertyValue]) -> Vec<RecordId> {
        self.entries
            .get(key)
            .map(|rids| rids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries within `range`, in key order (then rid order)
    pub fn scan(&self, range: &IndexRange, ascending: bool) -> StorageResult<Vec<IndexEntry>> {
        if !range.is_full_scan() && !self.definition.supports_range() && !is_point_lookup(range) {
            return Err(StorageError::RangeNotSupported(self.definition.name.clone()));
        }
        let lower = match &range.from {
            Some(bound) => Bound::Included(bound.key.clone()),
            None => Bound::Unbounded,
        };
        let mut result: Vec<IndexEntry> = self
            .entries
            .range((lower, Bound::Unbounded))
            .skip_while(|(key, _)| match &range.from {
                Some(bound) if !bound.inclusive => prefix_cmp(key, &bound.key) == Ordering::Equal,
                _ => false,
            })
            .take_while(|(key, _)| match &range.to {
                Some(bound) => within_upper(key, bound),
                None => true,
            })
            .flat_map(|(key, rids)| {
                rids.iter().map(move |rid| IndexEntry {
                    key: key.clone(),
                    rid: *rid,
                })
            })
            .collect();
        if !ascending {
            result.reverse();
        }
        Ok(result)
    }
}

fn is_point_lookup(range: &IndexRange) -> bool {
    match (&range.from, &range.to) {
        (Some(from), Some(to)) => from.inclusive && to.inclusive && from.key == to.key,
        _ => false,
    }
}

/// Compare only the first `bound.len()` components of `key`
fn prefix_cmp(key: &[PropertyValue], bound: &[PropertyValue]) -> Ordering {
    let len = bound.len().min(key.len());
    key[..len].cmp(&bound[..len])
}

fn within_upper(key: &[PropertyValue], bound: &KeyBound) -> bool {
    match prefix_cmp(key, &bound.key) {
        Ordering::Less => true,
        Ordering::Equal => bound.inclusive,
        Ordering::Greater => false,
    }
}
