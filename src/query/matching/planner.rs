//! MATCH planning
//!
//! The pattern is split into connected components. Each component gets a
//! root (the cheapest alias to enumerate) and a depth-first schedule of its
//! edges, so that every traversal starts from an alias that is already bound
//! and every `$matched.x` reference in a filter points at a bound alias.
//! Edges whose ends are both bound when they come up turn into consistency
//! checks. Components are joined with a cartesian product.

use super::pattern::{assign_default_aliases, collect_constraints, AliasConstraints, Pattern};
use super::traverser::EdgeTraversal;
use crate::query::ast::{Expression, MatchReturn, MatchStatement, SelectTarget};
use crate::query::executor::context::{CommandContext, MATCHED};
use crate::query::executor::plan::SelectExecutionPlan;
use crate::query::executor::planner::SelectPlanner;
use crate::query::executor::step::{ExecutionStep, StepKind};
use crate::query::executor::{ExecutionError, ExecutionResult};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use tracing::debug;

/// Aliases referenced as `$matched.<alias>` anywhere in `expr`
pub fn matched_aliases(expr: &Expression, out: &mut FxHashSet<String>) {
    match expr {
        Expression::Property { base, name } => {
            if matches!(base.as_ref(), Expression::Variable(v) if v == MATCHED) {
                out.insert(name.clone());
            } else {
                matched_aliases(base, out);
            }
        }
        Expression::Binary { left, right, .. } => {
            matched_aliases(left, out);
            matched_aliases(right, out);
        }
        Expression::Unary { expr, .. } => matched_aliases(expr, out),
        Expression::Function { args: items, .. } | Expression::List(items) => {
            for item in items {
                matched_aliases(item, out);
            }
        }
        Expression::Traverse { base, .. } => matched_aliases(base, out),
        Expression::Literal(_) | Expression::Field(_) | Expression::Variable(_) | Expression::Parameter(_) => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledEdge {
    edge: usize,
    reversed: bool,
}

/// Depth-first edge ordering from one root
struct Scheduler<'p> {
    pattern: &'p Pattern,
    dependencies: &'p [FxHashSet<String>],
    visited: Vec<bool>,
    order: Vec<usize>,
    scheduled: Vec<bool>,
    schedule: Vec<ScheduledEdge>,
}

impl<'p> Scheduler<'p> {
    fn new(pattern: &'p Pattern, dependencies: &'p [FxHashSet<String>]) -> Self {
        Scheduler {
            pattern,
            dependencies,
            visited: vec![false; pattern.nodes().len()],
            order: Vec::new(),
            scheduled: vec![false; pattern.edges().len()],
            schedule: Vec::new(),
        }
    }

    /// Complete schedule, or `None` when some edge can never be walked from `root`
    fn run(mut self, root: usize) -> Option<Vec<ScheduledEdge>> {
        self.visit(root);
        // Later passes pick up edges whose dependencies became satisfied
        loop {
            let before = self.schedule.len();
            for i in 0..self.order.len() {
                self.expand(self.order[i]);
            }
            if self.schedule.len() == before {
                break;
            }
        }
        (self.schedule.len() == self.pattern.edges().len()).then_some(self.schedule)
    }

    fn visit(&mut self, node: usize) {
        self.visited[node] = true;
        self.order.push(node);
        self.expand(node);
    }

    fn ready(&self, node: usize) -> bool {
        self.dependencies[node]
            .iter()
            .all(|alias| self.pattern.find(alias).is_some_and(|n| self.visited[n]))
    }

    fn expand(&mut self, node: usize) {
        let edges: Vec<usize> = self.pattern.incident_edges(node).collect();
        for id in edges {
            if self.scheduled[id] {
                continue;
            }
            let edge = self.pattern.edge(id);
            let other = edge.other(node);
            if !self.ready(other) {
                continue;
            }
            let reversed = if self.visited[other] {
                false
            } else if self.pattern.node(node).optional {
                continue;
            } else if edge.from == node {
                false
            } else if EdgeTraversal::is_reversible(&edge.item) {
                true
            } else {
                continue;
            };
            self.scheduled[id] = true;
            self.schedule.push(ScheduledEdge { edge: id, reversed });
            if !self.visited[other] {
                self.visit(other);
            }
        }
    }
}

/// Builds execution plans for MATCH statements
pub struct MatchPlanner<'a> {
    statement: &'a MatchStatement,
    select: SelectPlanner,
}

impl<'a> MatchPlanner<'a> {
    pub fn new(statement: &'a MatchStatement) -> Self {
        MatchPlanner {
            statement,
            select: SelectPlanner::new(),
        }
    }

    pub fn plan(&self, ctx: &CommandContext) -> ExecutionResult<SelectExecutionPlan> {
        if self.statement.expressions.is_empty() {
            return Err(ExecutionError::PlanningError("MATCH needs at least one expression".to_string()));
        }
        let expressions = assign_default_aliases(&self.statement.expressions);
        let pattern = Pattern::from_expressions(&expressions)?;
        pattern.validate()?;
        let constraints = collect_constraints(&expressions, ctx.session())?;
        let estimates = estimate_root_entries(&constraints, ctx)?;

        let mut plan = SelectExecutionPlan::new();
        let hopeless = pattern
            .nodes()
            .iter()
            .find(|node| !node.optional && estimates.get(&node.alias) == Some(&0));
        if let Some(node) = hopeless {
            debug!("MATCH alias {} has no candidates", node.alias);
            plan.chain(ExecutionStep::new(StepKind::Empty {
                reason: format!("no records for alias {}", node.alias),
            }));
            plan.set_profiling(ctx.is_profiling());
            return Ok(plan);
        }

        let mut sub_plans = pattern
            .components()
            .iter()
            .map(|component| self.plan_component(component, &constraints, &estimates, ctx))
            .collect::<ExecutionResult<Vec<_>>>()?;
        if sub_plans.len() == 1 {
            plan = sub_plans.remove(0);
        } else {
            plan.chain(ExecutionStep::cartesian_product(sub_plans)?);
        }

        if pattern.has_optional() {
            plan.chain(ExecutionStep::new(StepKind::RemoveEmptyOptionals));
        }
        plan.chain(ExecutionStep::new(match &self.statement.returns {
            MatchReturn::Patterns => StepKind::ReturnMatchPatterns,
            MatchReturn::Paths => StepKind::ReturnMatchPaths,
            MatchReturn::Elements => StepKind::ReturnMatchElements,
            MatchReturn::PathElements => StepKind::ReturnMatchPathElements,
            MatchReturn::Items(items) => StepKind::Projection { items: items.clone() },
        }));
        if let Some(skip) = self.statement.skip {
            plan.chain(ExecutionStep::new(StepKind::Skip(skip)));
        }
        if let Some(limit) = self.statement.limit {
            plan.chain(ExecutionStep::new(StepKind::Limit(limit)));
        }
        plan.set_profiling(ctx.is_profiling());
        Ok(plan)
    }

    fn plan_component(
        &self,
        pattern: &Pattern,
        constraints: &IndexMap<String, AliasConstraints>,
        estimates: &IndexMap<String, usize>,
        ctx: &CommandContext,
    ) -> ExecutionResult<SelectExecutionPlan> {
        let mut plan = SelectExecutionPlan::new();
        if pattern.edges().is_empty() {
            let alias = &pattern.node(0).alias;
            plan.chain(self.match_first(alias, constraints, ctx)?);
            return Ok(plan);
        }

        let dependencies: Vec<FxHashSet<String>> = pattern
            .nodes()
            .iter()
            .map(|node| {
                let mut deps = FxHashSet::default();
                if let Some(filter) = constraints.get(&node.alias).and_then(|c| c.filter.as_ref()) {
                    matched_aliases(filter, &mut deps);
                }
                deps.remove(&node.alias);
                deps
            })
            .collect();

        let mut roots: Vec<usize> = (0..pattern.nodes().len())
            .filter(|&id| {
                let node = pattern.node(id);
                !node.optional && dependencies[id].is_empty() && estimates.contains_key(&node.alias)
            })
            .collect();
        roots.sort_by_key(|&id| estimates[&pattern.node(id).alias]);

        let (root, schedule) = roots
            .iter()
            .find_map(|&root| Scheduler::new(pattern, &dependencies).run(root).map(|s| (root, s)))
            .ok_or_else(|| {
                ExecutionError::PlanningError(format!(
                    "MATCH pattern over {} cannot be evaluated: no alias with a class or rid can start it, \
                     or filters have a circular $matched dependency",
                    pattern.aliases().collect::<Vec<_>>().join(", ")
                ))
            })?;
        debug!("MATCH component rooted at {}", pattern.node(root).alias);

        plan.chain(self.match_first(&pattern.node(root).alias, constraints, ctx)?);
        for scheduled in schedule {
            let edge = pattern.edge(scheduled.edge);
            let (from, to) = (&pattern.node(edge.from).alias, &pattern.node(edge.to).alias);
            let (traversal, target) = if scheduled.reversed {
                (
                    EdgeTraversal::reverse(to, from, &edge.item, constraint_of(constraints, from))?,
                    edge.from,
                )
            } else {
                (EdgeTraversal::forward(from, to, &edge.item, constraint_of(constraints, to)), edge.to)
            };
            plan.chain(ExecutionStep::new(StepKind::Match {
                traversal,
                optional: pattern.node(target).optional,
            }));
        }
        Ok(plan)
    }

    /// Source step enumerating the records of a root alias
    fn match_first(
        &self,
        alias: &str,
        constraints: &IndexMap<String, AliasConstraints>,
        ctx: &CommandContext,
    ) -> ExecutionResult<ExecutionStep> {
        let constraint = constraint_of(constraints, alias);
        let target = match (constraint.rid, &constraint.class) {
            (Some(rid), _) => SelectTarget::Rids(vec![rid]),
            (None, Some(class)) => SelectTarget::Class(class.clone()),
            (None, None) => {
                return Err(ExecutionError::PlanningError(format!(
                    "MATCH alias {} needs a class or rid to start from",
                    alias
                )))
            }
        };
        let mut plan = SelectExecutionPlan::new();
        self.select
            .chain_fetch(&mut plan, &target, constraint.filter.as_ref(), &[], ctx)?;
        plan.set_profiling(ctx.is_profiling());
        Ok(ExecutionStep::new(StepKind::MatchFirst {
            alias: alias.to_string(),
            plan,
        }))
    }
}

fn constraint_of(constraints: &IndexMap<String, AliasConstraints>, alias: &str) -> AliasConstraints {
    constraints.get(alias).cloned().unwrap_or_default()
}

/// Upper bound on the records each alias can start from; aliases with
/// neither class nor rid have no estimate
fn estimate_root_entries(
    constraints: &IndexMap<String, AliasConstraints>,
    ctx: &CommandContext,
) -> ExecutionResult<IndexMap<String, usize>> {
    let mut estimates = IndexMap::new();
    for (alias, constraint) in constraints {
        if constraint.rid.is_some() {
            estimates.insert(alias.clone(), 1);
        } else if let Some(class) = &constraint.class {
            if !ctx.session().class_exists(class) {
                return Err(ExecutionError::PlanningError(format!("Class not found: {}", class)));
            }
            estimates.insert(alias.clone(), ctx.session().count_class(class)?);
        }
    }
    Ok(estimates)
}
