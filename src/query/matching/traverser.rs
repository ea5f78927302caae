//! Edge traversal for one partial match
//!
//! A traverser starts from the record bound to the source alias of a row,
//! walks one path item (or a bounded recursion of it), keeps the targets that
//! satisfy the alias constraints and merges each one back into the row.

use super::pattern::AliasConstraints;
use crate::graph::RecordId;
use crate::query::ast::{Expression, MatchPathItem, PathItem};
use crate::query::eval::traverse;
use crate::query::executor::context::{CommandContext, CURRENT, DEPTH, MATCHED};
use crate::query::executor::fetch::value_to_row;
use crate::query::executor::{ExecutionError, ExecutionResult, Row, Value};
use std::collections::VecDeque;
use std::fmt;

/// Row metadata holding the records walked before reaching a candidate
pub const MATCH_PATH: &str = "$matchPath";

/// WHILE / maxDepth settings of a recursive path item
#[derive(Debug, Clone, PartialEq)]
pub struct Recursion {
    pub while_condition: Option<Expression>,
    pub max_depth: Option<usize>,
    pub depth_alias: Option<String>,
    pub path_alias: Option<String>,
}

/// One scheduled pattern edge: walk `item` from the record bound to
/// `source` and bind the results to `target`
#[derive(Debug, Clone)]
pub struct EdgeTraversal {
    pub source: String,
    pub target: String,
    pub item: PathItem,
    /// Walked against its declared direction
    pub reversed: bool,
    pub constraints: AliasConstraints,
    pub recursion: Option<Recursion>,
}

impl EdgeTraversal {
    pub fn forward(source: &str, target: &str, item: &MatchPathItem, constraints: AliasConstraints) -> Self {
        let filter = &item.filter;
        let recursion = filter.is_recursive().then(|| Recursion {
            while_condition: filter.while_condition.clone(),
            max_depth: filter.max_depth,
            depth_alias: filter.depth_alias.clone(),
            path_alias: filter.path_alias.clone(),
        });
        EdgeTraversal {
            source: source.to_string(),
            target: target.to_string(),
            item: item.item.clone(),
            reversed: false,
            constraints,
            recursion,
        }
    }

    /// Walk `item` from its declared target back to its declared source
    pub fn reverse(source: &str, target: &str, item: &MatchPathItem, constraints: AliasConstraints) -> ExecutionResult<Self> {
        let method = match &item.item {
            PathItem::Method(method) if !item.filter.is_recursive() => method.reverse(),
            other => {
                return Err(ExecutionError::PlanningError(format!(
                    "Path item {} cannot be traversed in reverse",
                    other
                )))
            }
        };
        Ok(EdgeTraversal {
            source: source.to_string(),
            target: target.to_string(),
            item: PathItem::Method(method),
            reversed: true,
            constraints,
            recursion: None,
        })
    }

    pub fn is_reversible(item: &MatchPathItem) -> bool {
        matches!(item.item, PathItem::Method(_)) && !item.filter.is_recursive()
    }
}

impl fmt::Display for EdgeTraversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}{{{}}}", self.source, self.item, self.target)?;
        if let Some(recursion) = &self.recursion {
            if let Some(condition) = &recursion.while_condition {
                write!(f, " WHILE {}", condition)?;
            }
            if let Some(depth) = recursion.max_depth {
                write!(f, " MAXDEPTH {}", depth)?;
            }
        }
        Ok(())
    }
}

/// A value that may be bound to the target alias
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: Value,
    pub depth: usize,
    pub path: Vec<Value>,
}

impl Candidate {
    fn found(row: Row, depth: usize, path: Vec<Value>) -> Self {
        Candidate {
            value: Value::from(row),
            depth,
            path,
        }
    }

    /// Placeholder for an optional alias with nothing to bind
    pub fn empty_optional() -> Self {
        Candidate {
            value: Value::EmptyOptional,
            depth: 0,
            path: Vec::new(),
        }
    }
}

/// Combine a candidate with the row it was found from.
///
/// An unbound target (or one holding the empty-optional placeholder) takes
/// the candidate. A target already bound to the same record passes the row
/// through unchanged. Anything else rejects the candidate.
pub fn merge(source: &Row, traversal: &EdgeTraversal, candidate: Candidate) -> Option<Row> {
    match source.get(&traversal.target) {
        None | Some(Value::Null) | Some(Value::EmptyOptional) => {
            let mut row = source.clone();
            if let (Some(recursion), false) = (&traversal.recursion, candidate.value.is_empty_optional()) {
                if let Some(alias) = &recursion.depth_alias {
                    row.set(alias.clone(), Value::from(candidate.depth as i64));
                }
                if let Some(alias) = &recursion.path_alias {
                    row.set(alias.clone(), Value::List(candidate.path.clone()));
                }
            }
            row.set(traversal.target.clone(), candidate.value);
            Some(row)
        }
        Some(existing) if existing.same_binding(&candidate.value) => Some(source.clone()),
        Some(_) => None,
    }
}

enum TraverserState {
    Uninitialized,
    Bound(VecDeque<Candidate>),
    Exhausted,
}

/// Lazily computes the candidates of one source row, then yields merged rows
pub struct MatchEdgeTraverser {
    source: Row,
    traversal: EdgeTraversal,
    optional: bool,
    state: TraverserState,
}

impl MatchEdgeTraverser {
    pub fn new(source: Row, traversal: EdgeTraversal, optional: bool) -> Self {
        MatchEdgeTraverser {
            source,
            traversal,
            optional,
            state: TraverserState::Uninitialized,
        }
    }

    pub fn next_row(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Option<Row>> {
        ctx.check_interrupted()?;
        if matches!(self.state, TraverserState::Uninitialized) {
            let candidates = self.candidates(ctx)?;
            self.state = TraverserState::Bound(candidates.into());
        }
        loop {
            let candidate = match &mut self.state {
                TraverserState::Bound(queue) => queue.pop_front(),
                _ => return Ok(None),
            };
            match candidate {
                Some(candidate) => {
                    if let Some(row) = merge(&self.source, &self.traversal, candidate) {
                        return Ok(Some(row));
                    }
                }
                None => self.state = TraverserState::Exhausted,
            }
        }
    }

    fn candidates(&self, ctx: &mut CommandContext) -> ExecutionResult<Vec<Candidate>> {
        let start = match self.source.get(&self.traversal.source) {
            Some(value) => value_to_row(value.clone(), ctx)?,
            None => None,
        };
        let mut found = Vec::new();
        if let Some(start) = start {
            let mut scope = ctx.scoped(MATCHED, Value::from(self.source.clone()));
            match &self.traversal.recursion {
                None => {
                    for row in self.step(&start, &mut scope)? {
                        if self.accepts(&row, &mut scope)? {
                            found.push(Candidate::found(row, 1, Vec::new()));
                        }
                    }
                }
                Some(recursion) => self.expand(start, 0, Vec::new(), recursion, &mut scope, &mut found)?,
            }
        }
        if found.is_empty() && self.optional {
            found.push(Candidate::empty_optional());
        }
        Ok(found)
    }

    /// Records reachable from `from` through one application of the path item
    fn step(&self, from: &Row, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let value = {
            let scope = ctx.scoped(CURRENT, Value::from(from.clone()));
            match &self.traversal.item {
                PathItem::Method(method) => traverse(&Value::from(from.clone()), method, &scope)?,
                PathItem::Field(expr) => expr.evaluate(from, &scope)?,
            }
        };
        let values = match value {
            Value::List(items) => items,
            other => vec![other],
        };
        let mut rows = Vec::new();
        for value in values {
            if matches!(value, Value::Record(_) | Value::Row(_)) {
                rows.extend(value_to_row(value, ctx)?);
            }
        }
        Ok(rows)
    }

    /// Class, record and WHERE constraints of the target alias
    fn accepts(&self, row: &Row, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        let constraints = &self.traversal.constraints;
        if let Some(class) = &constraints.class {
            match row.class() {
                Some(actual) if ctx.session().is_subclass_of(actual, class) => {}
                _ => return Ok(false),
            }
        }
        if let Some(rid) = constraints.rid {
            if row.rid() != Some(rid) {
                return Ok(false);
            }
        }
        match &constraints.filter {
            Some(filter) => {
                let scope = ctx.scoped(CURRENT, Value::from(row.clone()));
                filter.matches(row, &scope)
            }
            None => Ok(true),
        }
    }

    /// Depth-first expansion; the start itself is a candidate at depth 0
    fn expand(
        &self,
        node: Row,
        depth: usize,
        path: Vec<Value>,
        recursion: &Recursion,
        ctx: &mut CommandContext,
        found: &mut Vec<Candidate>,
    ) -> ExecutionResult<()> {
        ctx.check_interrupted()?;
        let mut scope = ctx.scoped(DEPTH, Value::from(depth as i64));
        if self.accepts(&node, &mut scope)? {
            let mut candidate = node.clone();
            candidate.set_metadata(DEPTH, Value::from(depth as i64));
            candidate.set_metadata(MATCH_PATH, Value::List(path.clone()));
            found.push(Candidate::found(candidate, depth, path.clone()));
        }
        if recursion.max_depth.is_some_and(|max| depth >= max) {
            return Ok(());
        }
        if let Some(condition) = &recursion.while_condition {
            let proceed = {
                let current = scope.scoped(CURRENT, Value::from(node.clone()));
                condition.matches(&node, &current)?
            };
            if !proceed {
                return Ok(());
            }
        }

        let visited: Vec<RecordId> = path.iter().filter_map(Value::as_rid).chain(node.rid()).collect();
        let mut next_path = path;
        next_path.push(node.rid().map(Value::Record).unwrap_or_else(|| Value::from(node.clone())));
        for child in self.step(&node, &mut scope)? {
            if child.rid().is_some_and(|rid| visited.contains(&rid)) {
                continue;
            }
            self.expand(child, depth + 1, next_path.clone(), recursion, &mut scope, found)?;
        }
        Ok(())
    }
}
