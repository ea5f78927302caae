//! Control steps: FOR EACH loops and RETRY blocks
//!
//! Both run their body plan to completion when first pulled and expose the
//! collected rows. The body is restarted from scratch for every iteration or
//! attempt, so buffered mutating plans never replay a stale result.

use super::context::CommandContext;
use super::plan::SelectExecutionPlan;
use super::record::{Row, Value};
use super::stream::{self, StreamBox};
use super::ExecutionResult;
use crate::query::ast::Expression;
use tracing::{debug, warn};

/// Run `body` once per element of `source`, with `variable` bound to the element
pub fn for_each(prelude: Option<StreamBox>, variable: String, source: Expression, body: SelectExecutionPlan) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let items = match source.evaluate(&Row::new(), ctx)? {
                Value::List(items) => items,
                Value::Null | Value::EmptyOptional => Vec::new(),
                other => vec![other],
            };
            debug!("FOR EACH {} over {} items", variable, items.len());
            let mut rows = Vec::new();
            for item in items {
                ctx.check_interrupted()?;
                let mut scope = ctx.scoped(&variable, item);
                let results = body.execute_to_vec(&mut scope)?;
                rows.extend(results);
            }
            Ok(stream::from_rows(rows))
        }),
    )
}

/// Run `body` inside a transaction, starting over after retryable failures
pub fn retry(prelude: Option<StreamBox>, body: SelectExecutionPlan, retries: usize) -> StreamBox {
    stream::deferred(
        prelude,
        Box::new(move |ctx: &mut CommandContext| {
            let attempts = retries.max(1);
            let mut attempt = 1;
            loop {
                ctx.check_interrupted()?;
                match run_attempt(&body, ctx) {
                    Ok(rows) => return Ok(stream::from_rows(rows)),
                    Err(e) => {
                        if ctx.session().is_tx_active() {
                            ctx.session().rollback()?;
                        }
                        if !e.is_retryable() || attempt >= attempts {
                            return Err(e);
                        }
                        warn!("Attempt {} of {} failed, retrying: {}", attempt, attempts, e);
                        attempt += 1;
                    }
                }
            }
        }),
    )
}

fn run_attempt(body: &SelectExecutionPlan, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
    ctx.session().begin()?;
    let rows = body.execute_to_vec(ctx)?;
    ctx.session().commit()?;
    Ok(rows)
}
