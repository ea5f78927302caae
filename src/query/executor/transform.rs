//! Row transform steps: filtering, projection, ordering, unrolling and LET

use super::context::CommandContext;
use super::fetch::ENTRY_RID;
use super::plan::SelectExecutionPlan;
use super::record::{Row, Value};
use super::stream::{self, StreamBox, StreamExt, StreamFactory};
use super::{ExecutionError, ExecutionResult};
use crate::graph::RecordId;
use crate::query::ast::{Expression, OrderByItem, ProjectionItem};
use crate::query::eval::compare_values;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;

/// Fill each row with the next VALUES tuple, wrapping around when the tuples run out
pub fn insert_values(upstream: StreamBox, columns: Vec<String>, rows: Vec<Vec<Expression>>) -> StreamBox {
    let mut next_tuple = 0usize;
    upstream.map(move |mut row, ctx| {
        if rows.is_empty() {
            return Ok(row);
        }
        let tuple = &rows[next_tuple % rows.len()];
        next_tuple += 1;
        if tuple.len() != columns.len() {
            return Err(ExecutionError::RuntimeError(format!(
                "INSERT has {} columns but {} values",
                columns.len(),
                tuple.len()
            )));
        }
        for (column, expr) in columns.iter().zip(tuple) {
            let value = expr.evaluate(&row, ctx)?;
            row.set(column.clone(), value);
        }
        Ok(row)
    })
}

/// Load the record referenced by each index entry row
pub fn get_value_from_index_entry(upstream: StreamBox, classes: Vec<String>) -> StreamBox {
    upstream.filter(move |entry, ctx| {
        let rid = match entry.get(ENTRY_RID).and_then(Value::as_rid) {
            Some(rid) => rid,
            None => return Ok(None),
        };
        let entity = match ctx.session().load(rid)? {
            Some(entity) => entity,
            None => return Ok(None),
        };
        if !classes.is_empty() && !classes.iter().any(|c| ctx.session().is_subclass_of(&entity.class, c)) {
            return Ok(None);
        }
        Ok(Some(Row::from_entity(&entity)))
    })
}

pub fn filter(upstream: StreamBox, predicate: Expression) -> StreamBox {
    upstream.filter(move |row, ctx| Ok(if predicate.matches(&row, ctx)? { Some(row) } else { None }))
}

#[derive(Hash, PartialEq, Eq)]
enum DistinctKey {
    Record(RecordId),
    Projection(Row),
}

/// Drop rows already seen; record rows are compared by identity
pub fn distinct(upstream: StreamBox) -> StreamBox {
    let mut seen: FxHashSet<DistinctKey> = FxHashSet::default();
    upstream.filter(move |row, _| {
        let key = match row.rid() {
            Some(rid) => DistinctKey::Record(rid),
            None => DistinctKey::Projection(row.clone()),
        };
        Ok(if seen.insert(key) { Some(row) } else { None })
    })
}

pub fn projection(upstream: StreamBox, items: Vec<ProjectionItem>) -> StreamBox {
    upstream.map(move |row, ctx| {
        let mut projected = Row::new();
        for item in &items {
            projected.set(item.alias.clone(), item.expression.evaluate(&row, ctx)?);
        }
        Ok(projected)
    })
}

/// Blocking sort; ties keep their upstream order
pub fn order_by(upstream: StreamBox, items: Vec<OrderByItem>) -> StreamBox {
    stream::materialized(upstream, move |rows, ctx| {
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = items
                .iter()
                .map(|item| item.expression.evaluate(&row, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?;
            keyed.push((key, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, item) in items.iter().enumerate() {
                let ordering = compare_values(&a[i], &b[i]);
                let ordering = if item.ascending { ordering } else { ordering.reverse() };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    })
}

/// One row per element of a list-valued field; other rows pass unchanged
pub fn unroll(upstream: StreamBox, field: String) -> StreamBox {
    upstream.flat_map(move |row, _| match row.get(&field) {
        Some(Value::List(items)) => {
            let items = items.clone();
            let field = field.clone();
            Ok(stream::from_iter(items.into_iter().map(move |item| {
                let mut unrolled = row.clone();
                unrolled.set(field.clone(), item);
                unrolled
            })))
        }
        _ => Ok(stream::singleton(row)),
    })
}

/// Evaluate per row; the value is kept as row metadata and as a context variable
pub fn let_per_row(upstream: StreamBox, name: String, expression: Expression) -> StreamBox {
    upstream.map(move |mut row, ctx| {
        let value = expression.evaluate(&row, ctx)?;
        ctx.set_variable(name.clone(), value.clone());
        row.set_metadata(name.clone(), value);
        Ok(row)
    })
}

/// Bind a variable once, on first pull; yields no rows
pub fn global_let(prelude: Option<StreamBox>, name: String, expression: Expression) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let value = expression.evaluate(&Row::new(), ctx)?;
            ctx.set_variable(name, value);
            Ok(stream::empty())
        }),
    )
}

/// Rows of each sub-plan in turn; a sub-plan starts only when the previous one is exhausted
pub fn chain_sub_plans(prelude: Option<StreamBox>, plans: Vec<SelectExecutionPlan>) -> StreamBox {
    let factories: Vec<StreamFactory> = plans
        .into_iter()
        .map(|plan| Box::new(move |ctx: &mut CommandContext| plan.start(ctx)) as StreamFactory)
        .collect();
    match prelude {
        Some(prelude) => stream::deferred(
            Some(prelude),
            Box::new(move |_: &mut CommandContext| Ok(stream::concat(factories))),
        ),
        None => stream::concat(factories),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDatabase;
    use crate::query::ast::BinaryOp;
    use std::sync::Arc;

    fn context() -> CommandContext {
        CommandContext::new(Arc::new(MemoryDatabase::new()))
    }

    fn rows(values: &[(i64, &str)]) -> StreamBox {
        stream::from_rows(
            values
                .iter()
                .map(|(n, s)| Row::from_pairs([("n", Value::from(*n)), ("s", Value::from(*s))]))
                .collect(),
        )
    }

    #[test]
    fn test_order_by_is_stable() {
        let mut ctx = context();
        let items = vec![OrderByItem {
            expression: Expression::field("n"),
            ascending: false,
        }];
        let sorted = stream::drain(order_by(rows(&[(1, "a"), (3, "b"), (1, "c"), (2, "d")]), items), &mut ctx).unwrap();
        let order: Vec<Value> = sorted.iter().map(|r| r.property("s")).collect();
        assert_eq!(order, vec![Value::from("b"), Value::from("d"), Value::from("a"), Value::from("c")]);
    }

    #[test]
    fn test_distinct_projection_rows() {
        let mut ctx = context();
        let items = vec![ProjectionItem::new(Expression::field("n"), "n")];
        let projected = projection(rows(&[(1, "a"), (2, "b"), (1, "c")]), items);
        let unique = stream::drain(distinct(projected), &mut ctx).unwrap();
        assert_eq!(unique.len(), 2);
        assert!(!unique[0].has("s"));
    }

    #[test]
    fn test_unroll() {
        let mut ctx = context();
        let source = stream::from_rows(vec![
            Row::from_pairs([("tags", Value::List(vec![Value::from("x"), Value::from("y")]))]),
            Row::from_pairs([("tags", Value::from("z"))]),
        ]);
        let unrolled = stream::drain(unroll(source, "tags".to_string()), &mut ctx).unwrap();
        let tags: Vec<Value> = unrolled.iter().map(|r| r.property("tags")).collect();
        assert_eq!(tags, vec![Value::from("x"), Value::from("y"), Value::from("z")]);
    }

    #[test]
    fn test_let_steps() {
        let mut ctx = context();
        let prelude = global_let(None, "$limit".to_string(), Expression::literal(2i64));
        let source = stream::deferred(
            Some(prelude),
            Box::new(|_: &mut CommandContext| Ok(rows(&[(1, "a"), (2, "b"), (3, "c")]))),
        );
        let doubled = let_per_row(
            source,
            "$double".to_string(),
            Expression::binary(Expression::field("n"), BinaryOp::Mul, Expression::literal(2i64)),
        );
        let kept = filter(
            doubled,
            Expression::binary(Expression::field("n"), BinaryOp::Le, Expression::variable("$limit")),
        );
        let result = stream::drain(kept, &mut ctx).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1].metadata("$double"), Some(&Value::from(4i64)));
        assert_eq!(ctx.variable("$limit"), Some(&Value::from(2i64)));
    }

    #[test]
    fn test_insert_values_cycles_tuples() {
        let mut ctx = context();
        let source = stream::from_rows(vec![Row::new(), Row::new(), Row::new()]);
        let filled = insert_values(
            source,
            vec!["name".to_string()],
            vec![vec![Expression::literal("a")], vec![Expression::literal("b")]],
        );
        let result = stream::drain(filled, &mut ctx).unwrap();
        let names: Vec<Value> = result.iter().map(|r| r.property("name")).collect();
        assert_eq!(names, vec![Value::from("a"), Value::from("b"), Value::from("a")]);
    }
}
