//! Row structures for query execution
//!
//! Rows flow through the step pipeline. A row is an ordered property bag that
//! may be backed by a stored record, and it carries a separate metadata map
//! for traversal bookkeeping such as `$depth` and `$matchPath`.

use crate::graph::{Entity, EntityKind, PropertyMap, PropertyValue, RecordId};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Value types that can be bound to row properties and variables
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// A scalar or composite property value
    Property(PropertyValue),
    /// A lazy record reference
    Record(RecordId),
    /// A nested row
    Row(Box<Row>),
    List(Vec<Value>),
    /// Placeholder bound to an optional MATCH alias that found no candidate
    EmptyOptional,
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Property(p) => {
                1u8.hash(state);
                p.hash(state);
            }
            Value::Record(rid) => {
                2u8.hash(state);
                rid.hash(state);
            }
            Value::Row(row) => {
                3u8.hash(state);
                row.hash(state);
            }
            Value::List(items) => {
                4u8.hash(state);
                items.hash(state);
            }
            Value::EmptyOptional => 5u8.hash(state),
        }
    }
}

impl Value {
    /// Convert a stored property, turning links into record references
    pub fn from_property(value: &PropertyValue) -> Value {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Link(rid) => Value::Record(*rid),
            PropertyValue::Array(items) => Value::List(items.iter().map(Value::from_property).collect()),
            other => Value::Property(other.clone()),
        }
    }

    /// Convert back to a storable property
    pub fn to_property(&self) -> PropertyValue {
        match self {
            Value::Null | Value::EmptyOptional => PropertyValue::Null,
            Value::Property(p) => p.clone(),
            Value::Record(rid) => PropertyValue::Link(*rid),
            Value::Row(row) => match row.rid() {
                Some(rid) => PropertyValue::Link(rid),
                None => PropertyValue::Map(
                    row.properties()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_property()))
                        .collect(),
                ),
            },
            Value::List(items) => PropertyValue::Array(items.iter().map(Value::to_property).collect()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Property(PropertyValue::Null))
    }

    pub fn is_empty_optional(&self) -> bool {
        matches!(self, Value::EmptyOptional)
    }

    /// Identity of the record this value refers to, if any
    pub fn as_rid(&self) -> Option<RecordId> {
        match self {
            Value::Record(rid) => Some(*rid),
            Value::Row(row) => row.rid(),
            Value::Property(PropertyValue::Link(rid)) => Some(*rid),
            _ => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyValue> {
        match self {
            Value::Property(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Value::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.as_property().and_then(PropertyValue::as_integer)
    }

    pub fn as_boolean(&self) -> Option<bool> {
        self.as_property().and_then(PropertyValue::as_boolean)
    }

    /// True for values that point at a stored record
    pub fn is_record(&self) -> bool {
        self.as_rid().is_some()
    }

    /// Binding identity used by MATCH consistency checks: records compare by
    /// identity, everything else structurally
    pub fn same_binding(&self, other: &Value) -> bool {
        match (self.as_rid(), other.as_rid()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Property(p) => write!(f, "{}", p),
            Value::Record(rid) => write!(f, "{}", rid),
            Value::Row(row) => write!(f, "{}", row),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::EmptyOptional => write!(f, "<empty optional>"),
        }
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        Value::from_property(&value)
    }
}

impl From<RecordId> for Value {
    fn from(rid: RecordId) -> Self {
        Value::Record(rid)
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        Value::Row(Box::new(row))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Property(PropertyValue::Integer(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Property(PropertyValue::Boolean(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Property(PropertyValue::String(s.to_string()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Identity and schema data of the record backing a row
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub rid: RecordId,
    pub class: String,
    pub kind: EntityKind,
    pub version: u64,
}

/// What a row is backed by
#[derive(Debug, Clone)]
pub enum RowKind {
    /// Computed row with no backing record
    Projection,
    /// Read-only view of a stored record
    Record(RecordHeader),
    /// Record open for in-place mutation; `previous` holds the pre-update snapshot
    Updatable {
        header: RecordHeader,
        previous: Option<Box<Row>>,
    },
}

/// A single row flowing through the pipeline
///
/// Rows compare and hash by backing record and properties; metadata is ignored.
#[derive(Debug, Clone)]
pub struct Row {
    kind: RowKind,
    properties: IndexMap<String, Value>,
    metadata: IndexMap<String, Value>,
}

impl Row {
    /// Create a new empty projection row
    pub fn new() -> Self {
        Row {
            kind: RowKind::Projection,
            properties: IndexMap::new(),
            metadata: IndexMap::new(),
        }
    }

    /// Read-only row over a stored record
    pub fn from_entity(entity: &Entity) -> Self {
        Row {
            kind: RowKind::Record(RecordHeader {
                rid: entity.rid,
                class: entity.class.clone(),
                kind: entity.kind,
                version: entity.version,
            }),
            properties: entity
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_property(v)))
                .collect(),
            metadata: IndexMap::new(),
        }
    }

    /// Build a projection row from `(name, value)` pairs
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut row = Row::new();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    pub fn kind(&self) -> &RowKind {
        &self.kind
    }

    pub fn header(&self) -> Option<&RecordHeader> {
        match &self.kind {
            RowKind::Projection => None,
            RowKind::Record(header) | RowKind::Updatable { header, .. } => Some(header),
        }
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.header().map(|h| h.rid)
    }

    pub fn class(&self) -> Option<&str> {
        self.header().map(|h| h.class.as_str())
    }

    pub fn is_record(&self) -> bool {
        self.header().is_some()
    }

    pub fn is_updatable(&self) -> bool {
        matches!(self.kind, RowKind::Updatable { .. })
    }

    pub fn is_vertex(&self) -> bool {
        matches!(self.header().map(|h| h.kind), Some(EntityKind::Vertex))
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.header().map(|h| h.kind), Some(EntityKind::Edge { .. }))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Property value, `Null` when absent
    pub fn property(&self, name: &str) -> Value {
        self.properties.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Remove a property, keeping the order of the remaining ones
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.properties.shift_remove(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    pub fn property_names(&self) -> impl Iterator<Item = &String> {
        self.properties.keys()
    }

    pub fn clear_properties(&mut self) {
        self.properties.clear();
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn metadata(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }

    pub fn set_metadata(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(name.into(), value.into());
    }

    /// Open a record-backed row for mutation; projections cannot be adapted
    pub fn into_updatable(self) -> Option<Row> {
        let kind = match self.kind {
            RowKind::Projection => return None,
            RowKind::Record(header) => RowKind::Updatable { header, previous: None },
            updatable @ RowKind::Updatable { .. } => updatable,
        };
        Some(Row { kind, ..self })
    }

    /// Close an updatable row back into a read-only record row
    pub fn into_result(self) -> Option<Row> {
        match self.kind {
            RowKind::Updatable { header, .. } => Some(Row {
                kind: RowKind::Record(header),
                ..self
            }),
            _ => None,
        }
    }

    /// Retain the current content as the pre-update snapshot
    pub fn snapshot_previous(&mut self) {
        let snapshot = Row {
            kind: match &self.kind {
                RowKind::Updatable { header, .. } => RowKind::Record(header.clone()),
                other => other.clone(),
            },
            properties: self.properties.clone(),
            metadata: self.metadata.clone(),
        };
        if let RowKind::Updatable { previous, .. } = &mut self.kind {
            *previous = Some(Box::new(snapshot));
        }
    }

    pub fn previous(&self) -> Option<&Row> {
        match &self.kind {
            RowKind::Updatable { previous, .. } => previous.as_deref(),
            _ => None,
        }
    }

    /// Record to persist for a record-backed row
    pub fn to_entity(&self) -> Option<Entity> {
        let header = self.header()?;
        let properties: PropertyMap = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_property()))
            .collect();
        let mut entity = Entity::with_properties(header.rid, header.class.clone(), header.kind, properties);
        entity.version = header.version;
        Some(entity)
    }

    /// Refresh the header after a save bumped the record version
    pub fn set_version(&mut self, version: u64) {
        if let RowKind::Record(header) | RowKind::Updatable { header, .. } = &mut self.kind {
            header.version = version;
        }
    }
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.rid() == other.rid() && self.properties == other.properties
    }
}

impl Eq for Row {}

impl Hash for Row {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rid().hash(state);
        // Property maps compare regardless of order, so combine entry hashes commutatively
        let mut combined: u64 = 0;
        for (key, value) in &self.properties {
            let mut hasher = FxHasher::default();
            key.hash(&mut hasher);
            value.hash(&mut hasher);
            combined = combined.wrapping_add(hasher.finish());
        }
        combined.hash(state);
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        if let Some(header) = self.header() {
            write!(f, "@{} {}", header.class, header.rid)?;
            if !self.properties.is_empty() {
                write!(f, " ")?;
            }
        }
        for (i, (key, val)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, val)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Entity {
        let mut entity = Entity::new(RecordId::new(10, 3), "Person", EntityKind::Vertex);
        entity.set_property("name", "Alice");
        entity.set_property("friend", RecordId::new(10, 4));
        entity.version = 2;
        entity
    }

    #[test]
    fn test_row_from_entity() {
        let row = Row::from_entity(&person());
        assert_eq!(row.rid(), Some(RecordId::new(10, 3)));
        assert!(row.is_vertex());
        assert_eq!(row.property("friend"), Value::Record(RecordId::new(10, 4)));
        assert_eq!(row.property("missing"), Value::Null);
        assert_eq!(format!("{}", row), "{@Person #10:3 name: \"Alice\", friend: #10:4}");
    }

    #[test]
    fn test_updatable_round_trip() {
        let row = Row::from_entity(&person());
        assert!(Row::new().into_updatable().is_none());

        let mut updatable = row.into_updatable().unwrap();
        updatable.snapshot_previous();
        updatable.set("name", "Alicia");
        assert_eq!(updatable.previous().unwrap().property("name"), Value::from("Alice"));

        let entity = updatable.to_entity().unwrap();
        assert_eq!(entity.version, 2);
        assert_eq!(entity.get_property("friend"), Some(&PropertyValue::Link(RecordId::new(10, 4))));

        let result = updatable.into_result().unwrap();
        assert!(!result.is_updatable());
        assert!(result.into_result().is_none());
    }

    #[test]
    fn test_row_equality_ignores_metadata_and_order() {
        let mut a = Row::from_pairs([("x", 1i64), ("y", 2i64)]);
        let b = Row::from_pairs([("y", 2i64), ("x", 1i64)]);
        a.set_metadata("$depth", 3i64);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_same_binding() {
        let rid = RecordId::new(10, 3);
        let as_row = Value::from(Row::from_entity(&person()));
        assert!(Value::Record(rid).same_binding(&as_row));
        assert!(!Value::Record(rid).same_binding(&Value::Record(RecordId::new(10, 4))));
        assert!(Value::from(3i64).same_binding(&Value::from(3i64)));
        assert!(!Value::EmptyOptional.same_binding(&Value::Null));
    }

    #[test]
    fn test_value_property_conversion() {
        let list = Value::from_property(&PropertyValue::Array(vec![
            PropertyValue::Link(RecordId::new(1, 1)),
            PropertyValue::Integer(4),
        ]));
        assert_eq!(list, Value::List(vec![Value::Record(RecordId::new(1, 1)), Value::from(4i64)]));
        assert_eq!(Value::EmptyOptional.to_property(), PropertyValue::Null);
        assert!(Value::Property(PropertyValue::Null).is_null());
    }
}
