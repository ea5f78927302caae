//! Stored record implementation
//!
//! A record is a document, a vertex, or an edge linking two vertices. All
//! three carry a class name and an ordered property map.

use super::property::{PropertyMap, PropertyValue};
use super::types::RecordId;
use serde::{Deserialize, Serialize};

/// Structural kind of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Document,
    Vertex,
    /// Edge from `out` to `in`
    Edge { out: RecordId, to: RecordId },
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identity of this record
    pub rid: RecordId,

    /// Class the record belongs to
    pub class: String,

    pub kind: EntityKind,

    /// Optimistic concurrency version, bumped on every save
    pub version: u64,

    /// Properties associated with this record
    pub properties: PropertyMap,
}

impl Entity {
    pub fn new(rid: RecordId, class: impl Into<String>, kind: EntityKind) -> Self {
        Entity {
            rid,
            class: class.into(),
            kind,
            version: 0,
            properties: PropertyMap::new(),
        }
    }

    /// Create a record with properties
    pub fn with_properties(
        rid: RecordId,
        class: impl Into<String>,
        kind: EntityKind,
        properties: PropertyMap,
    ) -> Self {
        Entity {
            rid,
            class: class.into(),
            kind,
            version: 0,
            properties,
        }
    }

    /// Set a property value
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Remove a property, keeping the order of the remaining ones
    pub fn remove_property(&mut self, key: &str) -> Option<PropertyValue> {
        self.properties.shift_remove(key)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn is_vertex(&self) -> bool {
        matches!(self.kind, EntityKind::Vertex)
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, EntityKind::Edge { .. })
    }

    /// Endpoints of an edge record as `(out, in)`
    pub fn endpoints(&self) -> Option<(RecordId, RecordId)> {
        match self.kind {
            EntityKind::Edge { out, to } => Some((out, to)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_properties() {
        let mut entity = Entity::new(RecordId::new(10, 0), "Person", EntityKind::Vertex);
        entity.set_property("name", "Alice");
        entity.set_property("age", 30i64);
        entity.set_property("city", "Paris");

        assert_eq!(entity.get_property("name").unwrap().as_string(), Some("Alice"));
        assert_eq!(entity.remove_property("age"), Some(PropertyValue::Integer(30)));
        let keys: Vec<&String> = entity.properties.keys().collect();
        assert_eq!(keys, vec!["name", "city"]);
        assert!(!entity.has_property("age"));
    }

    #[test]
    fn test_entity_kinds() {
        let a = RecordId::new(10, 0);
        let b = RecordId::new(10, 1);
        let edge = Entity::new(RecordId::new(11, 0), "Knows", EntityKind::Edge { out: a, to: b });
        assert!(edge.is_edge());
        assert!(!edge.is_vertex());
        assert_eq!(edge.endpoints(), Some((a, b)));

        let doc = Entity::new(RecordId::new(12, 0), "Note", EntityKind::Document);
        assert_eq!(doc.endpoints(), None);
    }
}
