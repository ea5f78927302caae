//! Mutation steps: kind checks, updatable conversion, in-place updates,
//! persistence and batched commits

use super::record::{Row, Value};
use super::stream::{StreamBox, StreamExt};
use super::{ExecutionError, ExecutionResult};
use crate::graph::PropertyValue;
use crate::query::ast::{AssignOp, BinaryOp, Expression, UpdateItem};
use crate::query::eval::evaluate_binary_op;
use tracing::info;

/// Delete the record behind each row; the row passes on
pub fn delete(upstream: StreamBox) -> StreamBox {
    upstream.map(|row, ctx| {
        let rid = row
            .rid()
            .ok_or_else(|| ExecutionError::RuntimeError(format!("Cannot delete {}: not a stored record", row)))?;
        ctx.session().delete(rid)?;
        Ok(row)
    })
}

pub fn cast_to_vertex(upstream: StreamBox) -> StreamBox {
    upstream.map(|row, _| {
        if row.is_vertex() {
            Ok(row)
        } else {
            Err(ExecutionError::RuntimeError(format!("{} is not a vertex", row)))
        }
    })
}

pub fn cast_to_edge(upstream: StreamBox) -> StreamBox {
    upstream.map(|row, _| {
        if row.is_edge() {
            Ok(row)
        } else {
            Err(ExecutionError::RuntimeError(format!("{} is not an edge", row)))
        }
    })
}

/// Rows that are not backed by a record are dropped
pub fn convert_to_updatable(upstream: StreamBox) -> StreamBox {
    upstream.filter(|row, _| Ok(row.into_updatable()))
}

/// Rows that are not updatable are dropped
pub fn convert_to_result(upstream: StreamBox) -> StreamBox {
    upstream.filter(|row, _| Ok(row.into_result()))
}

fn assign(row: &mut Row, item: &UpdateItem, value: Value) -> ExecutionResult<()> {
    let value = match item.op {
        AssignOp::Assign => value,
        AssignOp::Add => evaluate_binary_op(BinaryOp::Add, &row.property(&item.field), &value)?,
        AssignOp::Subtract => evaluate_binary_op(BinaryOp::Sub, &row.property(&item.field), &value)?,
    };
    row.set(item.field.clone(), value);
    Ok(())
}

pub fn update_set(upstream: StreamBox, items: Vec<UpdateItem>) -> StreamBox {
    upstream.map(move |mut row, ctx| {
        if !row.is_updatable() {
            return Ok(row);
        }
        for item in &items {
            let value = item.value.evaluate(&row, ctx)?;
            assign(&mut row, item, value)?;
        }
        Ok(row)
    })
}

pub fn update_remove(upstream: StreamBox, fields: Vec<String>) -> StreamBox {
    upstream.map(move |mut row, _| {
        if row.is_updatable() {
            for field in &fields {
                row.remove(field);
            }
        }
        Ok(row)
    })
}

/// Properties of a map-like value, in order
fn document_entries(value: Value) -> ExecutionResult<Vec<(String, Value)>> {
    match value {
        Value::Property(PropertyValue::Map(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, Value::from_property(&v)))
            .collect()),
        Value::Row(row) => Ok(row.properties().iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(ExecutionError::TypeError(format!("Expected a map, got {}", other))),
    }
}

pub fn update_merge(upstream: StreamBox, document: Expression) -> StreamBox {
    upstream.map(move |mut row, ctx| {
        if !row.is_updatable() {
            return Ok(row);
        }
        for (key, value) in document_entries(document.evaluate(&row, ctx)?)? {
            row.set(key, value);
        }
        Ok(row)
    })
}

pub fn update_content(upstream: StreamBox, document: Expression) -> StreamBox {
    upstream.map(move |mut row, ctx| {
        if !row.is_updatable() {
            return Ok(row);
        }
        let entries = document_entries(document.evaluate(&row, ctx)?)?;
        row.clear_properties();
        for (key, value) in entries {
            row.set(key, value);
        }
        Ok(row)
    })
}

pub fn copy_record_before_update(upstream: StreamBox) -> StreamBox {
    upstream.map(|mut row, _| {
        row.snapshot_previous();
        Ok(row)
    })
}

/// Replace updatable rows with their pre-update snapshot
pub fn unwrap_previous_value(upstream: StreamBox) -> StreamBox {
    upstream.map(|row, _| {
        if !row.is_updatable() {
            return Ok(row);
        }
        row.previous()
            .cloned()
            .ok_or_else(|| ExecutionError::RuntimeError(format!("No previous value retained for {}", row)))
    })
}

/// Write updatable rows back through the session
pub fn save(upstream: StreamBox) -> StreamBox {
    upstream.map(|mut row, ctx| {
        if let Some(entity) = row.to_entity().filter(|_| row.is_updatable()) {
            let saved = ctx.session().save(&entity)?;
            row.set_version(saved.version);
        }
        Ok(row)
    })
}

/// Commit and reopen the active transaction whenever its entry count reaches a
/// multiple of `size`; rows pass unchanged
pub fn batch_commit(upstream: StreamBox, size: usize) -> StreamBox {
    upstream.map(move |row, ctx| {
        if size == 0 {
            return Err(ExecutionError::InvalidConfiguration("Batch size must be positive".to_string()));
        }
        let session = ctx.session();
        if session.is_tx_active() {
            let entries = session.tx_entry_count();
            if entries > 0 && entries % size == 0 {
                info!("Batch commit after {} entries", entries);
                session.commit()?;
                session.begin()?;
            }
        }
        Ok(row)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataSession, MemoryDatabase, RecordId};
    use crate::query::executor::context::CommandContext;
    use crate::query::executor::stream;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryDatabase>, RecordId, RecordId) {
        let db = MemoryDatabase::new();
        db.create_vertex_class("Person").unwrap();
        db.create_edge_class("Knows").unwrap();
        let alice = db.insert_vertex("Person", [("name", "Alice")]).unwrap();
        let bob = db.insert_vertex("Person", [("name", "Bob")]).unwrap();
        let edge = db.insert_edge("Knows", alice, bob, [("since", 2020i64)]).unwrap();
        (Arc::new(db), alice, edge)
    }

    fn load(ctx: &CommandContext, rid: RecordId) -> Row {
        Row::from_entity(&ctx.session().load(rid).unwrap().unwrap())
    }

    #[test]
    fn test_casts_name_offending_row() {
        let (db, alice, edge) = setup();
        let mut ctx = CommandContext::new(db);
        let rows = vec![load(&ctx, alice)];
        assert!(stream::drain(cast_to_vertex(stream::from_rows(rows.clone())), &mut ctx).is_ok());
        match stream::drain(cast_to_edge(stream::from_rows(rows)), &mut ctx) {
            Err(ExecutionError::RuntimeError(message)) => assert!(message.contains("#")),
            other => panic!("unexpected: {:?}", other),
        }
        let edges = vec![load(&ctx, edge)];
        assert!(stream::drain(cast_to_edge(stream::from_rows(edges)), &mut ctx).is_ok());
    }

    #[test]
    fn test_delete_requires_record() {
        let (db, alice, _) = setup();
        let mut ctx = CommandContext::new(db.clone());
        let deleted = stream::drain(delete(stream::from_rows(vec![load(&ctx, alice)])), &mut ctx).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(db.load(alice).unwrap().is_none());
        assert!(stream::drain(delete(stream::singleton(Row::new())), &mut ctx).is_err());
    }

    #[test]
    fn test_convert_drops_unadaptable_rows() {
        let (db, alice, _) = setup();
        let mut ctx = CommandContext::new(db);
        let source = stream::from_rows(vec![Row::new(), load(&ctx, alice)]);
        let updatable = stream::drain(convert_to_updatable(source), &mut ctx).unwrap();
        assert_eq!(updatable.len(), 1);
        let source = stream::from_rows(vec![Row::new(), updatable[0].clone()]);
        let results = stream::drain(convert_to_result(source), &mut ctx).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_updatable());
    }

    #[test]
    fn test_update_pipeline_with_previous_value() {
        let (db, alice, _) = setup();
        let mut ctx = CommandContext::new(db.clone());
        let source = convert_to_updatable(stream::from_rows(vec![load(&ctx, alice)]));
        let copied = copy_record_before_update(source);
        let set = update_set(
            copied,
            vec![
                UpdateItem::set("name", Expression::literal("Alicia")),
                UpdateItem::set("visits", Expression::literal(4i64)),
                UpdateItem {
                    field: "visits".to_string(),
                    op: AssignOp::Add,
                    value: Expression::literal(1i64),
                },
            ],
        );
        let removed = update_remove(set, vec!["missing".to_string()]);
        let before = unwrap_previous_value(save(removed));
        let rows = stream::drain(before, &mut ctx).unwrap();

        assert_eq!(rows[0].property("name"), Value::from("Alice"));
        let stored = db.load(alice).unwrap().unwrap();
        assert_eq!(stored.get_property("name"), Some(&PropertyValue::from("Alicia")));
        assert_eq!(stored.get_property("visits"), Some(&PropertyValue::from(5i64)));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_unwrap_without_snapshot_fails() {
        let (db, alice, _) = setup();
        let mut ctx = CommandContext::new(db);
        let source = convert_to_updatable(stream::from_rows(vec![load(&ctx, alice)]));
        assert!(matches!(
            stream::drain(unwrap_previous_value(source), &mut ctx),
            Err(ExecutionError::RuntimeError(_))
        ));
    }

    #[test]
    fn test_update_content_replaces_properties() {
        let (db, alice, _) = setup();
        let mut ctx = CommandContext::new(db.clone());
        let mut doc = indexmap::IndexMap::new();
        doc.insert("nick".to_string(), PropertyValue::from("Al"));
        let source = convert_to_updatable(stream::from_rows(vec![load(&ctx, alice)]));
        let content = update_content(source, Expression::literal(PropertyValue::Map(doc)));
        stream::drain(save(content), &mut ctx).unwrap();
        let stored = db.load(alice).unwrap().unwrap();
        assert!(!stored.has_property("name"));
        assert_eq!(stored.get_property("nick"), Some(&PropertyValue::from("Al")));
    }

    #[test]
    fn test_batch_commit_cadence() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_class("Note", None).unwrap();
        let mut ctx = CommandContext::new(db.clone());
        db.begin().unwrap();
        let source = crate::query::executor::fetch::create_records(None, "Note".to_string(), 7);
        let rows = stream::drain(batch_commit(save(source), 3), &mut ctx).unwrap();
        assert_eq!(rows.len(), 7);
        // Commits at 3 and 6 entries; the seventh save stays pending
        assert_eq!(db.commit_count(), 2);
        assert_eq!(db.tx_entry_count(), 1);
        db.commit().unwrap();
        assert_eq!(db.count_class("Note").unwrap(), 7);
    }

    #[test]
    fn test_batch_commit_without_transaction_is_identity() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_class("Note", None).unwrap();
        let mut ctx = CommandContext::new(db.clone());
        let source = crate::query::executor::fetch::create_records(None, "Note".to_string(), 4);
        let rows = stream::drain(batch_commit(save(source), 2), &mut ctx).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(db.commit_count(), 0);
    }
}
