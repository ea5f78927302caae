//! Index descriptors and scan ranges
//!
//! An index covers an ordered list of fields of one class. Composite keys are
//! `Vec<PropertyValue>` compared lexicographically, so a shorter key acts as a
//! prefix bound over every longer key that starts with it.

use crate::graph::{Entity, PropertyValue, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage structure of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Ordered, one record per key
    Unique,
    /// Ordered, many records per key
    NotUnique,
    /// Hashed; full-key lookups only
    Hash,
}

/// Which side of a map-valued field is indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapIndexBy {
    Key,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexField {
    pub name: String,
    /// Set when the field holds a map
    pub map_by: Option<MapIndexBy>,
}

impl IndexField {
    pub fn plain(name: impl Into<String>) -> Self {
        IndexField { name: name.into(), map_by: None }
    }

    pub fn map(name: impl Into<String>, by: MapIndexBy) -> Self {
        IndexField { name: name.into(), map_by: Some(by) }
    }
}

/// Declared index with its capabilities
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub class: String,
    pub fields: Vec<IndexField>,
    pub kind: IndexKind,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, class: impl Into<String>, fields: &[&str], kind: IndexKind) -> Self {
        IndexDefinition {
            name: name.into(),
            class: class.into(),
            fields: fields.iter().map(|f| IndexField::plain(*f)).collect(),
            kind,
        }
    }

    /// Single-field index over the keys or values of a map property
    pub fn on_map(
        name: impl Into<String>,
        class: impl Into<String>,
        field: &str,
        by: MapIndexBy,
        kind: IndexKind,
    ) -> Self {
        IndexDefinition {
            name: name.into(),
            class: class.into(),
            fields: vec![IndexField::map(field, by)],
            kind,
        }
    }

    pub fn supports_range(&self) -> bool {
        self.kind != IndexKind::Hash
    }

    pub fn is_unique(&self) -> bool {
        self.kind == IndexKind::Unique
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn by_key(&self, field: &str) -> bool {
        self.fields
            .iter()
            .any(|f| f.name == field && f.map_by == Some(MapIndexBy::Key))
    }

    pub fn by_value(&self, field: &str) -> bool {
        self.fields
            .iter()
            .any(|f| f.name == field && f.map_by == Some(MapIndexBy::Value))
    }

    /// Index keys produced by a record. Records with a missing or null field
    /// are not indexed; map fields fan out to one key per map key or value.
    pub fn keys_for(&self, entity: &Entity) -> Vec<Vec<PropertyValue>> {
        let mut keys: Vec<Vec<PropertyValue>> = vec![Vec::with_capacity(self.fields.len())];
        for field in &self.fields {
            let components: Vec<PropertyValue> = match (entity.get_property(&field.name), field.map_by) {
                (None, _) | (Some(PropertyValue::Null), _) => return Vec::new(),
                (Some(PropertyValue::Map(map)), Some(MapIndexBy::Key)) => {
                    map.keys().map(|k| PropertyValue::String(k.clone())).collect()
                }
                (Some(PropertyValue::Map(map)), Some(MapIndexBy::Value)) => map.values().cloned().collect(),
                (Some(_), Some(_)) => return Vec::new(),
                (Some(value), None) => vec![value.clone()],
            };
            keys = keys
                .into_iter()
                .flat_map(|prefix| {
                    components.iter().map(move |c| {
                        let mut key = prefix.clone();
                        key.push(c.clone());
                        key
                    })
                })
                .collect();
        }
        keys
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ON {}({})", self.name, self.class, self.field_names().join(", "))
    }
}

/// One side of a key range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBound {
    pub key: Vec<PropertyValue>,
    pub inclusive: bool,
}

impl KeyBound {
    pub fn included(key: Vec<PropertyValue>) -> Self {
        KeyBound { key, inclusive: true }
    }

    pub fn excluded(key: Vec<PropertyValue>) -> Self {
        KeyBound { key, inclusive: false }
    }
}

/// Key range of an index scan; bounds shorter than the index key are prefix bounds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRange {
    pub from: Option<KeyBound>,
    pub to: Option<KeyBound>,
}

impl IndexRange {
    /// Every entry of the index
    pub fn all() -> Self {
        IndexRange::default()
    }

    /// Entries whose key starts with `prefix`
    pub fn prefix(prefix: Vec<PropertyValue>) -> Self {
        IndexRange {
            from: Some(KeyBound::included(prefix.clone())),
            to: Some(KeyBound::included(prefix)),
        }
    }

    pub fn between(from: Option<KeyBound>, to: Option<KeyBound>) -> Self {
        IndexRange { from, to }
    }

    pub fn is_full_scan(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// One `(key, rid)` pair returned by an index scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: Vec<PropertyValue>,
    pub rid: RecordId,
}
