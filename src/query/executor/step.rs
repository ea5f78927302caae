//! Execution steps
//!
//! A step is one stage of a plan. Steps form a chain through `prev`; starting a
//! step starts its predecessor and wraps the resulting stream with the step's
//! own transformation. The set of step kinds is closed, so dispatch is a single
//! `match` over [`StepKind`].

use super::context::CommandContext;
use super::plan::{PlanDescription, SelectExecutionPlan};
use super::planner::IndexSearchDescriptor;
use super::record::Row;
use super::stream::{self, StreamBox, StreamExt};
use super::{control, fetch, mutation, transform, ExecutionError, ExecutionResult};
use crate::graph::RecordId;
use crate::index::IndexDefinition;
use crate::query::ast::{Expression, OrderByItem, ProjectionItem, UpdateItem};
use crate::query::matching::{self, EdgeTraversal};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Step kinds
#[derive(Debug, Clone)]
pub enum StepKind {
    // Sources
    FetchFromClass { class: String, ascending: bool },
    FetchFromRids { rids: Vec<RecordId> },
    FetchFromIndex { descriptor: IndexSearchDescriptor, ascending: bool },
    /// Whole-index scan used for ORDER BY without a filter
    FetchFromIndexValues { index: IndexDefinition, ascending: bool },
    /// Produces nothing; the planner saw an empty target
    Empty { reason: String },
    FetchFromVariable { name: String },
    /// `count` new updatable records of `class` (INSERT)
    CreateRecord { class: String, count: usize },

    // Row transforms
    /// Fill rows with VALUES tuples, cycling through them
    InsertValues { columns: Vec<String>, rows: Vec<Vec<Expression>> },
    /// Load records behind index entries, keeping those of `classes`
    GetValueFromIndexEntry { classes: Vec<String> },
    Filter { predicate: Expression },
    Distinct,
    Projection { items: Vec<ProjectionItem> },
    OrderBy { items: Vec<OrderByItem> },
    Skip(usize),
    Limit(usize),
    Unroll { field: String },
    /// Per-row LET
    Let { name: String, expression: Expression },
    /// Statement-level LET, evaluated once on first pull
    GlobalLet { name: String, expression: Expression },
    /// Rows of each sub-plan, one after the other
    ChainSubPlans { plans: Vec<SelectExecutionPlan> },

    // Mutations
    Delete,
    CastToVertex,
    CastToEdge,
    ConvertToUpdatable,
    ConvertToResult,
    UpdateSet { items: Vec<UpdateItem> },
    UpdateRemove { fields: Vec<String> },
    UpdateMerge { document: Expression },
    UpdateContent { document: Expression },
    CopyRecordBeforeUpdate,
    UnwrapPreviousValue,
    Save,
    /// Commit and reopen the transaction every `size` entries
    BatchCommit { size: usize },

    // Graph matching
    /// Bind `alias` to each record produced by `plan`
    MatchFirst { alias: String, plan: SelectExecutionPlan },
    Match { traversal: EdgeTraversal, optional: bool },
    /// Product of the rows of independent sub-plans, first sub-plan outermost
    CartesianProduct { plans: Vec<SelectExecutionPlan> },
    /// Run `body` once per row with `$current` bound to it
    WhileMatch { body: SelectExecutionPlan },
    RemoveEmptyOptionals,
    ReturnMatchPatterns,
    ReturnMatchPaths,
    ReturnMatchElements,
    ReturnMatchPathElements,

    // Control
    /// Run `body` once per element of `source`, bound to `variable`
    ForEach { variable: String, source: Expression, body: SelectExecutionPlan },
    /// Run `body` in a transaction, re-running it on retryable failures
    Retry { body: SelectExecutionPlan, retries: usize },
}

impl StepKind {
    /// Steps that only read the upstream they are given
    fn requires_upstream(&self) -> bool {
        !matches!(
            self,
            StepKind::FetchFromClass { .. }
                | StepKind::FetchFromRids { .. }
                | StepKind::FetchFromIndex { .. }
                | StepKind::FetchFromIndexValues { .. }
                | StepKind::Empty { .. }
                | StepKind::FetchFromVariable { .. }
                | StepKind::CreateRecord { .. }
                | StepKind::GlobalLet { .. }
                | StepKind::ChainSubPlans { .. }
                | StepKind::MatchFirst { .. }
                | StepKind::CartesianProduct { .. }
                | StepKind::ForEach { .. }
                | StepKind::Retry { .. }
        )
    }
}

/// One stage of an execution plan
#[derive(Debug)]
pub struct ExecutionStep {
    kind: StepKind,
    prev: Option<Box<ExecutionStep>>,
    profiling: bool,
    /// Nanoseconds spent in pulls of this step's stream
    cost: Arc<AtomicU64>,
}

impl Clone for ExecutionStep {
    /// Deep copy with a fresh cost counter
    fn clone(&self) -> Self {
        ExecutionStep {
            kind: self.kind.clone(),
            prev: self.prev.clone(),
            profiling: self.profiling,
            cost: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ExecutionStep {
    pub fn new(kind: StepKind) -> Self {
        ExecutionStep {
            kind,
            prev: None,
            profiling: false,
            cost: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    /// Batch commit step; the size is evaluated here, once
    pub fn batch_commit(size: &Expression, ctx: &CommandContext) -> ExecutionResult<Self> {
        let value = size.evaluate(&Row::new(), ctx)?;
        let size = value
            .as_integer()
            .ok_or_else(|| ExecutionError::InvalidConfiguration(format!("Batch size must be an integer, got {}", value)))?;
        if size <= 0 {
            return Err(ExecutionError::InvalidConfiguration(format!(
                "Batch size must be positive, got {}",
                size
            )));
        }
        Ok(ExecutionStep::new(StepKind::BatchCommit { size: size as usize }))
    }

    pub fn cartesian_product(plans: Vec<SelectExecutionPlan>) -> ExecutionResult<Self> {
        if plans.is_empty() {
            return Err(ExecutionError::InvalidConfiguration(
                "Cartesian product needs at least one sub-plan".to_string(),
            ));
        }
        Ok(ExecutionStep::new(StepKind::CartesianProduct { plans }))
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn prev(&self) -> Option<&ExecutionStep> {
        self.prev.as_deref()
    }

    pub fn set_prev(&mut self, prev: ExecutionStep) {
        self.prev = Some(Box::new(prev));
    }

    pub fn prev_mut(&mut self) -> Option<&mut ExecutionStep> {
        self.prev.as_deref_mut()
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
    }

    pub fn set_profiling(&mut self, profiling: bool) {
        self.profiling = profiling;
    }

    /// Structural deep copy with fresh cost counters
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Copy that accumulates into this step's cost counters, sub-plans included
    pub(crate) fn share(&self) -> Self {
        let mut step = ExecutionStep {
            kind: self.kind.clone(),
            prev: self.prev.as_ref().map(|prev| Box::new(prev.share())),
            profiling: self.profiling,
            cost: Arc::clone(&self.cost),
        };
        for (shared, original) in step.sub_plans_mut().into_iter().zip(self.sub_plans()) {
            *shared = original.share();
        }
        step
    }

    /// Total nanoseconds spent pulling this step, upstream included
    pub fn cost(&self) -> u64 {
        self.cost.load(Ordering::Relaxed)
    }

    /// Nanoseconds spent in this step alone
    pub fn self_cost(&self) -> u64 {
        let upstream = self.prev.as_ref().filter(|p| p.profiling).map_or(0, |p| p.cost());
        self.cost().saturating_sub(upstream)
    }

    /// False when the step's shape depends on the data seen at planning time
    pub fn can_be_cached(&self) -> bool {
        match &self.kind {
            StepKind::Empty { .. } | StepKind::FetchFromIndexValues { .. } => false,
            // The batch size may come from a parameter evaluated at construction
            StepKind::BatchCommit { .. } => false,
            _ => self.sub_plans().iter().all(|p| p.can_be_cached()),
        }
    }

    pub fn sub_plans(&self) -> Vec<&SelectExecutionPlan> {
        match &self.kind {
            StepKind::ChainSubPlans { plans } | StepKind::CartesianProduct { plans } => plans.iter().collect(),
            StepKind::MatchFirst { plan, .. } => vec![plan],
            StepKind::WhileMatch { body } | StepKind::ForEach { body, .. } | StepKind::Retry { body, .. } => {
                vec![body]
            }
            _ => Vec::new(),
        }
    }

    pub fn sub_plans_mut(&mut self) -> Vec<&mut SelectExecutionPlan> {
        match &mut self.kind {
            StepKind::ChainSubPlans { plans } | StepKind::CartesianProduct { plans } => plans.iter_mut().collect(),
            StepKind::MatchFirst { plan, .. } => vec![plan],
            StepKind::WhileMatch { body } | StepKind::ForEach { body, .. } | StepKind::Retry { body, .. } => {
                vec![body]
            }
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            StepKind::FetchFromClass { .. } => "FETCH FROM CLASS",
            StepKind::FetchFromRids { .. } => "FETCH FROM RIDS",
            StepKind::FetchFromIndex { .. } => "FETCH FROM INDEX",
            StepKind::FetchFromIndexValues { .. } => "FETCH FROM INDEX VALUES",
            StepKind::Empty { .. } => "EMPTY",
            StepKind::FetchFromVariable { .. } => "FETCH FROM VARIABLE",
            StepKind::CreateRecord { .. } => "CREATE EMPTY RECORDS",
            StepKind::InsertValues { .. } => "SET VALUES",
            StepKind::GetValueFromIndexEntry { .. } => "EXTRACT VALUE FROM INDEX ENTRY",
            StepKind::Filter { .. } => "FILTER ITEMS WHERE",
            StepKind::Distinct => "DISTINCT",
            StepKind::Projection { .. } => "CALCULATE PROJECTIONS",
            StepKind::OrderBy { .. } => "ORDER BY",
            StepKind::Skip(_) => "SKIP",
            StepKind::Limit(_) => "LIMIT",
            StepKind::Unroll { .. } => "UNWIND",
            StepKind::Let { .. } => "LET (for each record)",
            StepKind::GlobalLet { .. } => "LET (once)",
            StepKind::ChainSubPlans { .. } => "FETCH FROM SUB-PLANS",
            StepKind::Delete => "DELETE",
            StepKind::CastToVertex => "CAST TO VERTEX",
            StepKind::CastToEdge => "CAST TO EDGE",
            StepKind::ConvertToUpdatable => "CONVERT TO UPDATABLE ITEM",
            StepKind::ConvertToResult => "CONVERT TO REGULAR RESULT ITEM",
            StepKind::UpdateSet { .. } => "UPDATE SET",
            StepKind::UpdateRemove { .. } => "UPDATE REMOVE",
            StepKind::UpdateMerge { .. } => "UPDATE MERGE",
            StepKind::UpdateContent { .. } => "UPDATE CONTENT",
            StepKind::CopyRecordBeforeUpdate => "COPY RECORD CONTENT BEFORE UPDATE",
            StepKind::UnwrapPreviousValue => "UNWRAP PREVIOUS VALUE",
            StepKind::Save => "SAVE RECORD",
            StepKind::BatchCommit { .. } => "BATCH COMMIT",
            StepKind::MatchFirst { .. } => "SET",
            StepKind::Match { optional: true, .. } => "OPTIONAL MATCH",
            StepKind::Match { .. } => "MATCH",
            StepKind::CartesianProduct { .. } => "CARTESIAN PRODUCT",
            StepKind::WhileMatch { .. } => "WHILE MATCH",
            StepKind::RemoveEmptyOptionals => "REMOVE EMPTY OPTIONALS",
            StepKind::ReturnMatchPatterns => "RETURN $patterns",
            StepKind::ReturnMatchPaths => "RETURN $paths",
            StepKind::ReturnMatchElements => "UNROLL $elements",
            StepKind::ReturnMatchPathElements => "UNROLL $pathElements",
            StepKind::ForEach { .. } => "FOR EACH",
            StepKind::Retry { .. } => "RETRY",
        }
    }

    /// Step-specific detail printed after the name
    fn detail(&self) -> Option<String> {
        match &self.kind {
            StepKind::FetchFromClass { class, ascending } => {
                Some(format!("{}{}", class, if *ascending { "" } else { " DESC" }))
            }
            StepKind::FetchFromRids { rids } => Some(
                rids.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", "),
            ),
            StepKind::FetchFromIndex { descriptor, ascending } => Some(format!(
                "{}{}",
                descriptor,
                if *ascending { "" } else { " DESC" }
            )),
            StepKind::FetchFromIndexValues { index, ascending } => {
                Some(format!("{} {}", index.name, if *ascending { "ASC" } else { "DESC" }))
            }
            StepKind::Empty { reason } => Some(format!("({})", reason)),
            StepKind::FetchFromVariable { name } => Some(name.clone()),
            StepKind::CreateRecord { class, count } => Some(format!("{} x{}", class, count)),
            StepKind::InsertValues { columns, .. } => Some(format!("({})", columns.join(", "))),
            StepKind::GetValueFromIndexEntry { classes } if !classes.is_empty() => {
                Some(format!("filtering classes [{}]", classes.join(", ")))
            }
            StepKind::Filter { predicate } => Some(predicate.to_string()),
            StepKind::Projection { items } => Some(
                items
                    .iter()
                    .map(|i| format!("{} AS {}", i.expression, i.alias))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            StepKind::OrderBy { items } => Some(
                items
                    .iter()
                    .map(|i| format!("{} {}", i.expression, if i.ascending { "ASC" } else { "DESC" }))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            StepKind::Skip(n) | StepKind::Limit(n) => Some(n.to_string()),
            StepKind::Unroll { field } => Some(field.clone()),
            StepKind::Let { name, expression } | StepKind::GlobalLet { name, expression } => {
                Some(format!("{} = {}", name, expression))
            }
            StepKind::UpdateSet { items } => Some(
                items
                    .iter()
                    .map(|i| format!("{} = {}", i.field, i.value))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            StepKind::UpdateRemove { fields } => Some(fields.join(", ")),
            StepKind::UpdateMerge { document } | StepKind::UpdateContent { document } => Some(document.to_string()),
            StepKind::BatchCommit { size } => Some(format!("every {} entries", size)),
            StepKind::MatchFirst { alias, .. } => Some(format!("{{{}}}", alias)),
            StepKind::Match { traversal, .. } => Some(format!(
                "{}\n{}",
                if traversal.reversed { "<----" } else { "---->" },
                traversal
            )),
            StepKind::ForEach { variable, source, .. } => Some(format!("{} IN {}", variable, source)),
            StepKind::Retry { retries, .. } => Some(format!("up to {} attempts", retries)),
            _ => None,
        }
    }

    /// `+ NAME detail` lines for this step and its sub-plans
    pub fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let pad = " ".repeat(depth * indent);
        let mut out = format!("{}+ {}", pad, self.name());
        if let Some(detail) = self.detail() {
            let mut lines = detail.lines();
            if let Some(first) = lines.next() {
                let _ = write!(out, " {}", first);
            }
            for line in lines {
                let _ = write!(out, "\n{}  {}", pad, line);
            }
        }
        if self.profiling {
            let _ = write!(out, " ({:.3}μs)", self.self_cost() as f64 / 1000.0);
        }
        for plan in self.sub_plans() {
            out.push('\n');
            out.push_str(&plan.pretty_print(depth + 1, indent));
        }
        out
    }

    pub fn introspect(&self) -> StepDescription {
        StepDescription {
            name: self.name().to_string(),
            detail: self.detail(),
            cost_ns: if self.profiling { Some(self.self_cost()) } else { None },
            sub_plans: self.sub_plans().iter().map(|p| p.introspect()).collect(),
        }
    }

    fn upstream(&self, ctx: &mut CommandContext) -> ExecutionResult<StreamBox> {
        match &self.prev {
            Some(prev) => prev.start(ctx),
            None => Err(ExecutionError::MissingUpstream {
                step: self.name().to_string(),
            }),
        }
    }

    /// Upstream of a source step: drained for its side effects before the source runs
    fn prelude(&self, ctx: &mut CommandContext) -> ExecutionResult<Option<StreamBox>> {
        self.prev.as_ref().map(|prev| prev.start(ctx)).transpose()
    }

    /// Start this step and, through it, the chain before it
    pub fn start(&self, ctx: &mut CommandContext) -> ExecutionResult<StreamBox> {
        if self.kind.requires_upstream() && self.prev.is_none() {
            return Err(ExecutionError::MissingUpstream {
                step: self.name().to_string(),
            });
        }
        let stream = match &self.kind {
            StepKind::FetchFromClass { class, ascending } => {
                fetch::fetch_from_class(self.prelude(ctx)?, class.clone(), *ascending)
            }
            StepKind::FetchFromRids { rids } => fetch::fetch_from_rids(self.prelude(ctx)?, rids.clone()),
            StepKind::FetchFromIndex { descriptor, ascending } => {
                fetch::fetch_from_index(self.prelude(ctx)?, descriptor.clone(), *ascending)
            }
            StepKind::FetchFromIndexValues { index, ascending } => {
                fetch::fetch_from_index_values(self.prelude(ctx)?, index.name.clone(), *ascending)
            }
            StepKind::Empty { .. } => stream::deferred(self.prelude(ctx)?, Box::new(|_: &mut CommandContext| Ok(stream::empty()))),
            StepKind::FetchFromVariable { name } => fetch::fetch_from_variable(self.prelude(ctx)?, name.clone()),
            StepKind::CreateRecord { class, count } => {
                fetch::create_records(self.prelude(ctx)?, class.clone(), *count)
            }
            StepKind::InsertValues { columns, rows } => {
                transform::insert_values(self.upstream(ctx)?, columns.clone(), rows.clone())
            }
            StepKind::GetValueFromIndexEntry { classes } => {
                transform::get_value_from_index_entry(self.upstream(ctx)?, classes.clone())
            }
            StepKind::Filter { predicate } => transform::filter(self.upstream(ctx)?, predicate.clone()),
            StepKind::Distinct => transform::distinct(self.upstream(ctx)?),
            StepKind::Projection { items } => transform::projection(self.upstream(ctx)?, items.clone()),
            StepKind::OrderBy { items } => transform::order_by(self.upstream(ctx)?, items.clone()),
            StepKind::Skip(n) => self.upstream(ctx)?.skip(*n),
            StepKind::Limit(n) => self.upstream(ctx)?.limit(*n),
            StepKind::Unroll { field } => transform::unroll(self.upstream(ctx)?, field.clone()),
            StepKind::Let { name, expression } => {
                transform::let_per_row(self.upstream(ctx)?, name.clone(), expression.clone())
            }
            StepKind::GlobalLet { name, expression } => {
                transform::global_let(self.prelude(ctx)?, name.clone(), expression.clone())
            }
            StepKind::ChainSubPlans { plans } => transform::chain_sub_plans(self.prelude(ctx)?, share_all(plans)),
            StepKind::Delete => mutation::delete(self.upstream(ctx)?),
            StepKind::CastToVertex => mutation::cast_to_vertex(self.upstream(ctx)?),
            StepKind::CastToEdge => mutation::cast_to_edge(self.upstream(ctx)?),
            StepKind::ConvertToUpdatable => mutation::convert_to_updatable(self.upstream(ctx)?),
            StepKind::ConvertToResult => mutation::convert_to_result(self.upstream(ctx)?),
            StepKind::UpdateSet { items } => mutation::update_set(self.upstream(ctx)?, items.clone()),
            StepKind::UpdateRemove { fields } => mutation::update_remove(self.upstream(ctx)?, fields.clone()),
            StepKind::UpdateMerge { document } => mutation::update_merge(self.upstream(ctx)?, document.clone()),
            StepKind::UpdateContent { document } => {
                mutation::update_content(self.upstream(ctx)?, document.clone())
            }
            StepKind::CopyRecordBeforeUpdate => mutation::copy_record_before_update(self.upstream(ctx)?),
            StepKind::UnwrapPreviousValue => mutation::unwrap_previous_value(self.upstream(ctx)?),
            StepKind::Save => mutation::save(self.upstream(ctx)?),
            StepKind::BatchCommit { size } => mutation::batch_commit(self.upstream(ctx)?, *size),
            StepKind::MatchFirst { alias, plan } => {
                matching::steps::match_first(self.prelude(ctx)?, alias.clone(), plan.share())
            }
            StepKind::Match { traversal, optional } => {
                matching::steps::match_edge(self.upstream(ctx)?, traversal.clone(), *optional)
            }
            StepKind::CartesianProduct { plans } => {
                matching::steps::cartesian_product(self.prelude(ctx)?, share_all(plans))?
            }
            StepKind::WhileMatch { body } => matching::steps::while_match(self.upstream(ctx)?, body.share()),
            StepKind::RemoveEmptyOptionals => matching::steps::remove_empty_optionals(self.upstream(ctx)?),
            StepKind::ReturnMatchPatterns => matching::steps::return_patterns(self.upstream(ctx)?),
            StepKind::ReturnMatchPaths => self.upstream(ctx)?,
            StepKind::ReturnMatchElements => matching::steps::return_elements(self.upstream(ctx)?, false),
            StepKind::ReturnMatchPathElements => matching::steps::return_elements(self.upstream(ctx)?, true),
            StepKind::ForEach { variable, source, body } => {
                control::for_each(self.prelude(ctx)?, variable.clone(), source.clone(), body.share())
            }
            StepKind::Retry { body, retries } => control::retry(self.prelude(ctx)?, body.share(), *retries),
        };
        Ok(if self.profiling {
            stream.profiled(Arc::clone(&self.cost))
        } else {
            stream
        })
    }
}

fn share_all(plans: &[SelectExecutionPlan]) -> Vec<SelectExecutionPlan> {
    plans.iter().map(SelectExecutionPlan::share).collect()
}

/// Serializable description of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescription {
    pub name: String,
    pub detail: Option<String>,
    pub cost_ns: Option<u64>,
    pub sub_plans: Vec<PlanDescription>,
}
