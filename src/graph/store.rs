//! In-memory reference database
//!
//! Implements [`DataSession`] over hash/B-Tree maps guarded by a lock:
//! - records: RecordId -> Entity (ordered, so class scans come out in rid order)
//! - outgoing / incoming: vertex -> edge rids (adjacency lists)
//! - classes: single-inheritance schema rooted at `V` (vertices) and `E` (edges)
//! - indexes: maintained on every save/delete through [`IndexManager`]
//!
//! Transactions keep an undo log so `rollback` restores the pre-transaction
//! state. Writes outside a transaction apply immediately.

use super::entity::{Entity, EntityKind};
use super::property::{PropertyMap, PropertyValue};
use super::session::{DataSession, StorageError, StorageResult};
use super::types::{Direction, RecordId};
use crate::index::{IndexDefinition, IndexEntry, IndexManager, IndexRange};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Base class of every vertex class
pub const VERTEX_CLASS: &str = "V";
/// Base class of every edge class
pub const EDGE_CLASS: &str = "E";

#[derive(Debug, Clone)]
struct SchemaClass {
    superclass: Option<String>,
    cluster: i32,
}

#[derive(Debug, Default)]
struct Transaction {
    /// (record, state before the operation)
    undo: Vec<(RecordId, Option<Entity>)>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    classes: IndexMap<String, SchemaClass>,
    records: BTreeMap<RecordId, Entity>,
    next_position: HashMap<i32, i64>,
    outgoing: HashMap<RecordId, Vec<RecordId>>,
    incoming: HashMap<RecordId, Vec<RecordId>>,
    tx: Option<Transaction>,
    commits: usize,
    pending_conflicts: usize,
}

impl DatabaseState {
    fn hierarchy(&self, class: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            current = self.classes.get(&name).and_then(|c| c.superclass.clone());
            chain.push(name);
        }
        chain
    }

    fn is_subclass_of(&self, class: &str, parent: &str) -> bool {
        self.classes.contains_key(class) && self.hierarchy(class).iter().any(|c| c == parent)
    }

    fn record_op(&mut self, rid: RecordId, previous: Option<Entity>) {
        if let Some(tx) = self.tx.as_mut() {
            tx.undo.push((rid, previous));
        }
    }
}

/// In-memory database implementing the engine's session contract
#[derive(Debug)]
pub struct MemoryDatabase {
    state: RwLock<DatabaseState>,
    indexes: IndexManager,
}

impl MemoryDatabase {
    /// Create an empty database with the `V` and `E` base classes
    pub fn new() -> Self {
        let mut state = DatabaseState::default();
        state.classes.insert(
            VERTEX_CLASS.to_string(),
            SchemaClass { superclass: None, cluster: 1 },
        );
        state.classes.insert(
            EDGE_CLASS.to_string(),
            SchemaClass { superclass: None, cluster: 2 },
        );
        MemoryDatabase {
            state: RwLock::new(state),
            indexes: IndexManager::new(),
        }
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, DatabaseState>> {
        self.state.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, DatabaseState>> {
        self.state.write().map_err(|_| StorageError::LockPoisoned)
    }

    /// Create a class, optionally inheriting from `superclass`
    pub fn create_class(&self, name: &str, superclass: Option<&str>) -> StorageResult<()> {
        let mut state = self.write()?;
        if state.classes.contains_key(name) {
            return Err(StorageError::ClassAlreadyExists(name.to_string()));
        }
        if let Some(parent) = superclass {
            if !state.classes.contains_key(parent) {
                return Err(StorageError::ClassNotFound(parent.to_string()));
            }
        }
        let cluster = 10 + state.classes.len() as i32;
        debug!("Creating class {} (cluster {})", name, cluster);
        state.classes.insert(
            name.to_string(),
            SchemaClass {
                superclass: superclass.map(str::to_string),
                cluster,
            },
        );
        Ok(())
    }

    pub fn create_vertex_class(&self, name: &str) -> StorageResult<()> {
        self.create_class(name, Some(VERTEX_CLASS))
    }

    pub fn create_edge_class(&self, name: &str) -> StorageResult<()> {
        self.create_class(name, Some(EDGE_CLASS))
    }

    /// Declare an index and index the records its class already holds
    pub fn create_index(&self, definition: IndexDefinition) -> StorageResult<()> {
        let state = self.read()?;
        if !state.classes.contains_key(&definition.class) {
            return Err(StorageError::ClassNotFound(definition.class.clone()));
        }
        let class = definition.class.clone();
        self.indexes.create_index(definition)?;
        for entity in state.records.values() {
            if state.is_subclass_of(&entity.class, &class) {
                self.indexes.index_record(entity, &state.hierarchy(&entity.class))?;
            }
        }
        Ok(())
    }

    pub fn insert_document<K, V>(&self, class: &str, properties: impl IntoIterator<Item = (K, V)>) -> StorageResult<RecordId>
    where
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let mut entity = self.new_record(class)?;
        entity.properties = collect_properties(properties);
        Ok(self.save(&entity)?.rid)
    }

    pub fn insert_vertex<K, V>(&self, class: &str, properties: impl IntoIterator<Item = (K, V)>) -> StorageResult<RecordId>
    where
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        if !self.is_subclass_of(class, VERTEX_CLASS) {
            return Err(StorageError::ClassNotFound(format!("{} (vertex class)", class)));
        }
        self.insert_document(class, properties)
    }

    /// Create an edge `from -> to`
    pub fn insert_edge<K, V>(
        &self,
        class: &str,
        from: RecordId,
        to: RecordId,
        properties: impl IntoIterator<Item = (K, V)>,
    ) -> StorageResult<RecordId>
    where
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let rid = {
            let mut state = self.write()?;
            if !state.is_subclass_of(class, EDGE_CLASS) {
                return Err(StorageError::ClassNotFound(format!("{} (edge class)", class)));
            }
            allocate(&mut state, class)?
        };
        let entity = Entity::with_properties(
            rid,
            class,
            EntityKind::Edge { out: from, to },
            collect_properties(properties),
        );
        Ok(self.save(&entity)?.rid)
    }

    /// Number of transactions committed so far
    pub fn commit_count(&self) -> usize {
        self.read().map(|s| s.commits).unwrap_or(0)
    }

    /// Total number of stored records
    pub fn record_count(&self) -> usize {
        self.read().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Make the next `count` saves fail with a concurrent-modification error.
    /// Used to exercise retry paths.
    pub fn inject_conflicts(&self, count: usize) -> StorageResult<()> {
        self.write()?.pending_conflicts = count;
        Ok(())
    }

    fn attach(&self, state: &mut DatabaseState, entity: Entity) -> StorageResult<()> {
        let hierarchy = state.hierarchy(&entity.class);
        self.indexes.index_record(&entity, &hierarchy)?;
        if let EntityKind::Edge { out, to } = entity.kind {
            state.outgoing.entry(out).or_default().push(entity.rid);
            state.incoming.entry(to).or_default().push(entity.rid);
        }
        state.records.insert(entity.rid, entity);
        Ok(())
    }

    fn detach(&self, state: &mut DatabaseState, rid: RecordId) -> StorageResult<Option<Entity>> {
        let entity = match state.records.remove(&rid) {
            Some(entity) => entity,
            None => return Ok(None),
        };
        let hierarchy = state.hierarchy(&entity.class);
        self.indexes.unindex_record(&entity, &hierarchy)?;
        if let EntityKind::Edge { out, to } = entity.kind {
            if let Some(edges) = state.outgoing.get_mut(&out) {
                edges.retain(|e| *e != rid);
            }
            if let Some(edges) = state.incoming.get_mut(&to) {
                edges.retain(|e| *e != rid);
            }
        }
        Ok(Some(entity))
    }

    fn validate_edge(state: &DatabaseState, entity: &Entity) -> StorageResult<()> {
        if let EntityKind::Edge { out, to } = entity.kind {
            for endpoint in [out, to] {
                match state.records.get(&endpoint) {
                    Some(v) if v.is_vertex() => {}
                    Some(_) => return Err(StorageError::InvalidEdge(format!("{} is not a vertex", endpoint))),
                    None => return Err(StorageError::InvalidEdge(format!("{} does not exist", endpoint))),
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_properties<K, V>(properties: impl IntoIterator<Item = (K, V)>) -> PropertyMap
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    properties.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

fn allocate(state: &mut DatabaseState, class: &str) -> StorageResult<RecordId> {
    let cluster = state
        .classes
        .get(class)
        .map(|c| c.cluster)
        .ok_or_else(|| StorageError::ClassNotFound(class.to_string()))?;
    let next = state.next_position.entry(cluster).or_insert(0);
    let rid = RecordId::new(cluster, *next);
    *next += 1;
    Ok(rid)
}

impl DataSession for MemoryDatabase {
    fn begin(&self) -> StorageResult<()> {
        let mut state = self.write()?;
        if state.tx.is_none() {
            state.tx = Some(Transaction::default());
        }
        Ok(())
    }

    fn commit(&self) -> StorageResult<()> {
        let mut state = self.write()?;
        let tx = state.tx.take().ok_or(StorageError::NoActiveTransaction)?;
        state.commits += 1;
        info!("Committed transaction with {} entries", tx.undo.len());
        Ok(())
    }

    fn rollback(&self) -> StorageResult<()> {
        let mut state = self.write()?;
        let tx = state.tx.take().ok_or(StorageError::NoActiveTransaction)?;
        debug!("Rolling back {} entries", tx.undo.len());
        for (rid, previous) in tx.undo.into_iter().rev() {
            self.detach(&mut state, rid)?;
            if let Some(entity) = previous {
                self.attach(&mut state, entity)?;
            }
        }
        Ok(())
    }

    fn is_tx_active(&self) -> bool {
        self.read().map(|s| s.tx.is_some()).unwrap_or(false)
    }

    fn tx_entry_count(&self) -> usize {
        self.read()
            .map(|s| s.tx.as_ref().map(|tx| tx.undo.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn load(&self, rid: RecordId) -> StorageResult<Option<Entity>> {
        Ok(self.read()?.records.get(&rid).cloned())
    }

    fn new_record(&self, class: &str) -> StorageResult<Entity> {
        let mut state = self.write()?;
        if state.is_subclass_of(class, EDGE_CLASS) {
            return Err(StorageError::InvalidEdge(format!(
                "edge of class {} needs endpoints",
                class
            )));
        }
        let kind = if state.is_subclass_of(class, VERTEX_CLASS) {
            EntityKind::Vertex
        } else {
            EntityKind::Document
        };
        let rid = allocate(&mut state, class)?;
        Ok(Entity::new(rid, class, kind))
    }

    fn save(&self, entity: &Entity) -> StorageResult<Entity> {
        let mut state = self.write()?;
        if !state.classes.contains_key(&entity.class) {
            return Err(StorageError::ClassNotFound(entity.class.clone()));
        }
        let stored_version = state.records.get(&entity.rid).map(|e| e.version);
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StorageError::ConcurrentModification {
                rid: entity.rid,
                stored: stored_version.unwrap_or(0),
                provided: entity.version,
            });
        }
        if let Some(stored) = stored_version {
            if stored != entity.version {
                return Err(StorageError::ConcurrentModification {
                    rid: entity.rid,
                    stored,
                    provided: entity.version,
                });
            }
        } else {
            Self::validate_edge(&state, entity)?;
        }

        let mut saved = entity.clone();
        saved.version += 1;
        let previous = self.detach(&mut state, entity.rid)?;
        if let Err(e) = self.attach(&mut state, saved.clone()) {
            if let Some(previous) = previous {
                self.attach(&mut state, previous)?;
            }
            return Err(e);
        }
        state.record_op(entity.rid, previous);
        Ok(saved)
    }

    fn delete(&self, rid: RecordId) -> StorageResult<()> {
        let mut state = self.write()?;
        let entity = state
            .records
            .get(&rid)
            .cloned()
            .ok_or(StorageError::RecordNotFound(rid))?;
        if entity.is_vertex() {
            let mut attached: Vec<RecordId> = state.outgoing.get(&rid).cloned().unwrap_or_default();
            attached.extend(state.incoming.get(&rid).cloned().unwrap_or_default());
            for edge in attached {
                if let Some(removed) = self.detach(&mut state, edge)? {
                    state.record_op(edge, Some(removed));
                }
            }
            state.outgoing.remove(&rid);
            state.incoming.remove(&rid);
        }
        let removed = self.detach(&mut state, rid)?;
        state.record_op(rid, removed);
        Ok(())
    }

    fn class_exists(&self, class: &str) -> bool {
        self.read().map(|s| s.classes.contains_key(class)).unwrap_or(false)
    }

    fn is_subclass_of(&self, class: &str, parent: &str) -> bool {
        self.read().map(|s| s.is_subclass_of(class, parent)).unwrap_or(false)
    }

    fn count_class(&self, class: &str) -> StorageResult<usize> {
        let state = self.read()?;
        if !state.classes.contains_key(class) {
            return Err(StorageError::ClassNotFound(class.to_string()));
        }
        Ok(state
            .records
            .values()
            .filter(|e| state.is_subclass_of(&e.class, class))
            .count())
    }

    fn scan_class(&self, class: &str, ascending: bool) -> StorageResult<Vec<RecordId>> {
        let state = self.read()?;
        if !state.classes.contains_key(class) {
            return Err(StorageError::ClassNotFound(class.to_string()));
        }
        let mut rids: Vec<RecordId> = state
            .records
            .values()
            .filter(|e| state.is_subclass_of(&e.class, class))
            .map(|e| e.rid)
            .collect();
        if !ascending {
            rids.reverse();
        }
        Ok(rids)
    }

    fn indexes_for_class(&self, class: &str) -> Vec<IndexDefinition> {
        match self.read() {
            Ok(state) => self.indexes.definitions_for(&state.hierarchy(class)),
            Err(_) => Vec::new(),
        }
    }

    fn index_scan(&self, index: &str, range: &IndexRange, ascending: bool) -> StorageResult<Vec<IndexEntry>> {
        self.indexes.scan(index, range, ascending)
    }

    fn edges(&self, vertex: RecordId, direction: Direction, edge_class: Option<&str>) -> StorageResult<Vec<RecordId>> {
        let state = self.read()?;
        let mut edges = Vec::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            edges.extend(state.outgoing.get(&vertex).into_iter().flatten().cloned());
        }
        if matches!(direction, Direction::In | Direction::Both) {
            edges.extend(state.incoming.get(&vertex).into_iter().flatten().cloned());
        }
        if let Some(class) = edge_class {
            edges.retain(|e| {
                state
                    .records
                    .get(e)
                    .map(|edge| state.is_subclass_of(&edge.class, class))
                    .unwrap_or(false)
            });
        }
        Ok(edges)
    }
}
