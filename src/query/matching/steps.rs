//! Stream builders behind the MATCH step kinds

use super::pattern::is_user_alias;
use super::traverser::{EdgeTraversal, MatchEdgeTraverser};
use crate::query::executor::context::{CommandContext, CURRENT};
use crate::query::executor::fetch::value_to_row;
use crate::query::executor::plan::SelectExecutionPlan;
use crate::query::executor::stream::{self, StreamBox, StreamExt};
use crate::query::executor::{ExecutionError, ExecutionResult, Row, Value};
use tracing::debug;

/// Bind every row of `plan` to `alias`, starting a partial match per record
pub fn match_first(prelude: Option<StreamBox>, alias: String, plan: SelectExecutionPlan) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let records = plan.start(ctx)?;
            Ok(records.map(move |record, _| Ok(Row::from_pairs([(alias.clone(), Value::from(record))]))))
        }),
    )
}

/// Extend each partial match along one scheduled edge
pub fn match_edge(upstream: StreamBox, traversal: EdgeTraversal, optional: bool) -> StreamBox {
    upstream.flat_map(move |row, ctx| {
        ctx.check_interrupted()?;
        let mut traverser = MatchEdgeTraverser::new(row, traversal.clone(), optional);
        Ok(stream::produce(move |ctx| traverser.next_row(ctx)))
    })
}

fn combine(left: &Row, right: &Row) -> Row {
    let mut row = left.clone();
    for (name, value) in right.properties() {
        row.set(name.clone(), value.clone());
    }
    row
}

/// Every combination of the sub-plans' rows; the first sub-plan varies slowest.
/// All sub-plans but the first are buffered.
pub fn cartesian_product(prelude: Option<StreamBox>, plans: Vec<SelectExecutionPlan>) -> ExecutionResult<StreamBox> {
    if plans.is_empty() {
        return Err(ExecutionError::InvalidConfiguration(
            "Cartesian product needs at least one sub-plan".to_string(),
        ));
    }
    Ok(stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let mut plans = plans.into_iter();
            let outer = match plans.next() {
                Some(plan) => plan,
                None => return Ok(stream::empty()),
            };
            let mut tails = vec![Row::new()];
            for plan in plans {
                ctx.check_interrupted()?;
                let rows = plan.execute_to_vec(ctx)?;
                tails = tails
                    .iter()
                    .flat_map(|tail| rows.iter().map(move |row| combine(tail, row)))
                    .collect();
                if tails.is_empty() {
                    debug!("Cartesian product short-circuits on an empty sub-plan");
                    return Ok(stream::empty());
                }
            }
            Ok(outer.start(ctx)?.flat_map(move |row, ctx| {
                ctx.check_interrupted()?;
                let combined: Vec<Row> = tails.iter().map(|tail| combine(&row, tail)).collect();
                Ok(stream::from_rows(combined))
            }))
        }),
    ))
}

/// Run `body` once per upstream row with `$current` bound to it; the body's
/// rows replace the upstream row
pub fn while_match(upstream: StreamBox, body: SelectExecutionPlan) -> StreamBox {
    upstream.flat_map(move |row, ctx| {
        ctx.check_interrupted()?;
        let mut scope = ctx.scoped(CURRENT, Value::from(row));
        let rows = body.execute_to_vec(&mut scope)?;
        Ok(stream::from_rows(rows))
    })
}

/// Optional aliases that found nothing become null
pub fn remove_empty_optionals(upstream: StreamBox) -> StreamBox {
    upstream.map(|mut row, _| {
        let empty: Vec<String> = row
            .properties()
            .iter()
            .filter(|(_, value)| value.is_empty_optional())
            .map(|(name, _)| name.clone())
            .collect();
        for name in empty {
            row.set(name, Value::Null);
        }
        Ok(row)
    })
}

/// Keep only the aliases named in the statement
pub fn return_patterns(upstream: StreamBox) -> StreamBox {
    upstream.map(|row, _| {
        Ok(Row::from_pairs(
            row.properties()
                .iter()
                .filter(|(alias, _)| is_user_alias(alias))
                .map(|(alias, value)| (alias.clone(), value.clone())),
        ))
    })
}

/// One row per bound record; generated aliases only with `include_reserved`
pub fn return_elements(upstream: StreamBox, include_reserved: bool) -> StreamBox {
    upstream.flat_map(move |row, ctx| {
        let mut elements = Vec::new();
        for (alias, value) in row.properties() {
            if !include_reserved && !is_user_alias(alias) {
                continue;
            }
            if value.is_record() {
                elements.extend(value_to_row(value.clone(), ctx)?);
            }
        }
        Ok(stream::from_rows(elements))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDatabase;
    use crate::query::ast::{Expression, ProjectionItem};
    use crate::query::executor::step::{ExecutionStep, StepKind};
    use std::sync::Arc;

    fn context() -> CommandContext {
        CommandContext::new(Arc::new(MemoryDatabase::new()))
    }

    /// Rows `{alias: v}` for the list bound to `$alias`
    fn rows_plan(alias: &str) -> SelectExecutionPlan {
        let mut plan = SelectExecutionPlan::new();
        plan.chain(ExecutionStep::new(StepKind::FetchFromVariable {
            name: format!("${}", alias),
        }));
        plan.chain(ExecutionStep::new(StepKind::Projection {
            items: vec![ProjectionItem::new(Expression::field("value"), alias)],
        }));
        plan
    }

    fn bind_values(ctx: &mut CommandContext, alias: &str, values: &[i64]) {
        let list = values.iter().map(|v| Value::from(*v)).collect::<Vec<_>>();
        ctx.set_variable(format!("${}", alias), Value::List(list));
    }

    #[test]
    fn test_cartesian_product_order() {
        let mut ctx = context();
        bind_values(&mut ctx, "a", &[1, 2]);
        bind_values(&mut ctx, "b", &[10, 20, 30]);
        let product = cartesian_product(None, vec![rows_plan("a"), rows_plan("b")]).unwrap();
        let rows = stream::drain(product, &mut ctx).unwrap();
        let pairs: Vec<(Value, Value)> = rows.iter().map(|r| (r.property("a"), r.property("b"))).collect();
        assert_eq!(pairs.len(), 6);
        assert_eq!(pairs[0], (Value::from(1i64), Value::from(10i64)));
        assert_eq!(pairs[2], (Value::from(1i64), Value::from(30i64)));
        assert_eq!(pairs[3], (Value::from(2i64), Value::from(10i64)));
        assert!(cartesian_product(None, Vec::new()).is_err());
    }

    #[test]
    fn test_cartesian_product_with_empty_side() {
        let mut ctx = context();
        bind_values(&mut ctx, "a", &[1, 2]);
        bind_values(&mut ctx, "b", &[]);
        let product = cartesian_product(None, vec![rows_plan("a"), rows_plan("b")]).unwrap();
        assert!(stream::drain(product, &mut ctx).unwrap().is_empty());
    }

    #[test]
    fn test_return_shapes() {
        let mut ctx = context();
        let row = Row::from_pairs([
            ("p", Value::from(Row::from_pairs([("name", "x")]))),
            ("$DEFAULT_ALIAS_0", Value::EmptyOptional),
        ]);
        let cleaned = stream::drain(remove_empty_optionals(stream::singleton(row.clone())), &mut ctx).unwrap();
        assert_eq!(cleaned[0].property("$DEFAULT_ALIAS_0"), Value::Null);

        let patterns = stream::drain(return_patterns(stream::singleton(row.clone())), &mut ctx).unwrap();
        assert_eq!(patterns[0].property_names().collect::<Vec<_>>(), vec!["p"]);

        // Embedded rows carry no record identity
        let elements = stream::drain(return_elements(stream::singleton(row), true), &mut ctx).unwrap();
        assert!(elements.is_empty());
    }

    #[test]
    fn test_while_match_binds_current() {
        let mut ctx = context();
        let mut body = SelectExecutionPlan::new();
        body.chain(ExecutionStep::new(StepKind::FetchFromVariable {
            name: CURRENT.to_string(),
        }));
        let source = stream::from_rows(vec![Row::from_pairs([("n", 1i64)]), Row::from_pairs([("n", 2i64)])]);
        let rows = stream::drain(while_match(source, body), &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].property("n"), Value::from(2i64));
        assert!(ctx.variable(CURRENT).is_none());
    }
}
