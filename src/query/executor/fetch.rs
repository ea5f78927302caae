//! Source steps: class scans, rid lists, index scans, variables and new records
//!
//! Sources never pull their prelude (the steps chained before them, such as a
//! global LET) until they are pulled themselves. Storage scans check the
//! interrupt flag and deadline once per produced row.

use super::context::CommandContext;
use super::planner::IndexSearchDescriptor;
use super::record::{Row, Value};
use super::stream::{self, StreamBox, StreamExt};
use super::ExecutionResult;
use crate::graph::RecordId;
use crate::index::IndexRange;
use std::collections::VecDeque;
use tracing::debug;

/// Property of an index-entry row holding the key
pub const ENTRY_KEY: &str = "key";
/// Property of an index-entry row holding the record reference
pub const ENTRY_RID: &str = "rid";

/// Rows for stored records, loaded one at a time; records deleted since the
/// scan started are skipped
fn load_records(rids: Vec<RecordId>) -> StreamBox {
    let mut pending: VecDeque<RecordId> = rids.into();
    stream::produce(move |ctx: &mut CommandContext| {
        while let Some(rid) = pending.pop_front() {
            ctx.check_interrupted()?;
            if let Some(entity) = ctx.session().load(rid)? {
                return Ok(Some(Row::from_entity(&entity)));
            }
        }
        Ok(None)
    })
}

pub fn fetch_from_class(prelude: Option<StreamBox>, class: String, ascending: bool) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let rids = ctx.session().scan_class(&class, ascending)?;
            debug!("Scanning {} records of class {}", rids.len(), class);
            Ok(load_records(rids))
        }),
    )
}

pub fn fetch_from_rids(prelude: Option<StreamBox>, rids: Vec<RecordId>) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |_: &mut CommandContext| Ok(load_records(rids))),
    )
}

fn entry_rows(entries: Vec<crate::index::IndexEntry>) -> StreamBox {
    stream::from_iter(entries.into_iter().map(|entry| {
        Row::from_pairs([
            (
                ENTRY_KEY,
                Value::List(entry.key.iter().map(Value::from_property).collect()),
            ),
            (ENTRY_RID, Value::Record(entry.rid)),
        ])
    }))
    .interruptible()
}

/// Index entries within the descriptor's key range; bounds are evaluated on first pull
pub fn fetch_from_index(prelude: Option<StreamBox>, descriptor: IndexSearchDescriptor, ascending: bool) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let range = descriptor.range(ctx)?;
            let entries = ctx.session().index_scan(&descriptor.index.name, &range, ascending)?;
            debug!("Index {} returned {} entries", descriptor.index.name, entries.len());
            Ok(entry_rows(entries))
        }),
    )
}

/// Every entry of an index, in key order
pub fn fetch_from_index_values(prelude: Option<StreamBox>, index: String, ascending: bool) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let entries = ctx.session().index_scan(&index, &IndexRange::all(), ascending)?;
            Ok(entry_rows(entries))
        }),
    )
}

/// Rows held by a context variable: a list yields one row per element
pub fn fetch_from_variable(prelude: Option<StreamBox>, name: String) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let value = ctx.variable(&name).cloned().unwrap_or(Value::Null);
            let items = match value {
                Value::List(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                if let Some(row) = value_to_row(item, ctx)? {
                    rows.push(row);
                }
            }
            Ok(stream::from_rows(rows))
        }),
    )
}

/// Row for a bound value: records are loaded, scalars become `{value: ..}`
pub fn value_to_row(value: Value, ctx: &CommandContext) -> ExecutionResult<Option<Row>> {
    Ok(match value {
        Value::Row(row) => Some(*row),
        Value::Record(rid) => ctx.session().load(rid)?.map(|e| Row::from_entity(&e)),
        Value::Null | Value::EmptyOptional => None,
        other => Some(Row::from_pairs([("value", other)])),
    })
}

/// `count` new, unsaved, updatable records of `class`
pub fn create_records(prelude: Option<StreamBox>, class: String, count: usize) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |_: &mut CommandContext| {
            let mut created = 0;
            Ok(stream::produce(move |ctx: &mut CommandContext| {
                if created == count {
                    return Ok(None);
                }
                created += 1;
                let entity = ctx.session().new_record(&class)?;
                Ok(Row::from_entity(&entity).into_updatable())
            }))
        }),
    )
}
