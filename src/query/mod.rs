//! Query processing module
//!
//! Statements arrive as typed ASTs (no text parser is involved):
//! - SELECT over classes, record ids or variables, with index access paths
//! - MATCH graph patterns with optional legs and recursive traversal
//! - INSERT / UPDATE / DELETE as buffered mutating plans
//!
//! Execution follows a pull-based step pipeline (see [`executor`]).

pub mod ast;
pub mod cache;
pub mod eval;
pub mod executor;
pub mod matching;

// Re-export main types
pub use ast::{Expression, MatchStatement, SelectStatement};
pub use cache::PlanCache;
pub use executor::{
    CommandContext, ExecutionError, ExecutionPlan, ExecutionResult, Row, SelectExecutionPlan, SelectPlanner, Value,
};
pub use matching::MatchPlanner;

use crate::config::EngineConfig;
use crate::graph::DataSession;
use ast::{DeleteStatement, InsertStatement, UpdateStatement};
use std::sync::Arc;
use tracing::debug;

/// A statement ready for planning
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Match(MatchStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Statement::Select(_) | Statement::Match(_))
    }
}

/// Query engine - high-level interface for planning and executing statements
pub struct QueryEngine {
    session: Arc<dyn DataSession>,
    config: EngineConfig,
    planner: SelectPlanner,
    cache: PlanCache,
}

impl QueryEngine {
    pub fn new(session: Arc<dyn DataSession>) -> Self {
        Self::with_config(session, EngineConfig::default())
    }

    pub fn with_config(session: Arc<dyn DataSession>, config: EngineConfig) -> Self {
        let cache = PlanCache::new(config.plan_cache_size);
        QueryEngine {
            session,
            config,
            planner: SelectPlanner::new(),
            cache,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// A fresh execution context carrying the configured timeout and profiling flag
    pub fn context(&self) -> CommandContext {
        CommandContext::with_config(Arc::clone(&self.session), &self.config)
    }

    /// Build a new plan for `statement`, bypassing the cache
    pub fn plan(&self, statement: &Statement, ctx: &CommandContext) -> ExecutionResult<ExecutionPlan> {
        Ok(match statement {
            Statement::Select(select) => self.planner.plan_select(select, ctx)?.into(),
            Statement::Match(m) => MatchPlanner::new(m).plan(ctx)?.into(),
            Statement::Insert(insert) => self.planner.plan_insert(insert, ctx)?.into(),
            Statement::Update(update) => self.planner.plan_update(update, ctx)?.into(),
            Statement::Delete(delete) => self.planner.plan_delete(delete, ctx)?.into(),
        })
    }

    /// Plan for `statement`, taken from the cache under `text` when present
    pub fn prepare(&self, text: &str, statement: &Statement, ctx: &CommandContext) -> ExecutionResult<ExecutionPlan> {
        if let Some(plan) = self.cache.get(text) {
            return Ok(plan);
        }
        let plan = self.plan(statement, ctx)?;
        self.cache.put(text, &plan);
        Ok(plan)
    }

    /// Plan (or reuse) and run a statement, collecting its rows
    pub fn execute(&self, text: &str, statement: &Statement, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let mut plan = self.prepare(text, statement, ctx)?;
        debug!("Executing {}\n{}", text, plan.pretty_print(0, executor::plan::DEFAULT_INDENT));
        plan.execute_to_vec(ctx)
    }

    /// Run a statement inside a transaction, retrying on concurrent
    /// modification up to the configured number of attempts
    pub fn execute_with_retry(&self, statement: &Statement, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let body = match self.plan(statement, ctx)? {
            ExecutionPlan::Select(plan) => plan,
            ExecutionPlan::Update(plan) => plan.pipeline().clone(),
        };
        self.planner
            .plan_retry(body, self.config.max_retries, ctx)
            .execute_to_vec(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDatabase;
    use crate::query::ast::{BinaryOp, UpdateItem};

    fn engine() -> (Arc<MemoryDatabase>, QueryEngine) {
        let db = Arc::new(MemoryDatabase::new());
        db.create_vertex_class("Person").unwrap();
        db.insert_vertex("Person", [("name", "Alice")]).unwrap();
        db.insert_vertex("Person", [("name", "Bob")]).unwrap();
        let engine = QueryEngine::new(db.clone());
        (db, engine)
    }

    #[test]
    fn test_select_plans_are_cached() {
        let (_, engine) = engine();
        let mut ctx = engine.context();
        let select = Statement::Select(SelectStatement::from_class("Person"));
        assert_eq!(engine.execute("SELECT FROM Person", &select, &mut ctx).unwrap().len(), 2);
        assert_eq!(engine.cache().len(), 1);
        assert_eq!(engine.execute("SELECT FROM Person", &select, &mut ctx).unwrap().len(), 2);
    }

    #[test]
    fn test_update_with_retry() {
        let (db, engine) = engine();
        db.inject_conflicts(1).unwrap();
        let mut ctx = engine.context();
        let update = Statement::Update(UpdateStatement {
            class: "Person".to_string(),
            where_clause: Some(Expression::compare("name", BinaryOp::Eq, "Bob")),
            operations: vec![ast::UpdateOperation::Set(vec![UpdateItem::set("age", Expression::literal(40i64))])],
            return_before: false,
            batch_size: None,
            limit: None,
        });
        assert!(!update.is_read_only());
        let rows = engine.execute_with_retry(&update, &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property("age"), Value::from(40i64));
        assert_eq!(db.commit_count(), 1);
    }
}
