//! SELECT, UPDATE, DELETE and INSERT planning with index access-path selection
//!
//! The WHERE clause is flattened into OR-ed AND blocks. Each block is matched
//! against the class indexes; blocks that end up with the same index and the
//! same key conditions share a single index scan, with their leftover
//! conditions OR-ed into one residual filter.

use super::context::CommandContext;
use super::plan::{SelectExecutionPlan, UpdateExecutionPlan};
use super::record::Row;
use super::step::{ExecutionStep, StepKind};
use super::{ExecutionError, ExecutionResult};
use crate::index::{IndexDefinition, IndexKind, IndexRange, KeyBound, MapIndexBy};
use crate::query::ast::{
    BinaryOp, DeleteKind, DeleteStatement, Expression, InsertStatement, OrderByItem, SelectStatement,
    SelectTarget, UpdateOperation, UpdateStatement,
};
use rustc_hash::FxHashMap;
use std::fmt;
use tracing::debug;

/// Largest number of OR branches the planner expands a WHERE clause into
pub const MAX_WHERE_BRANCHES: usize = 64;

/// `field <op> value` condition served by an index
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    pub field: String,
    pub op: BinaryOp,
    /// Row-independent; evaluated when the scan starts
    pub value: Expression,
}

impl KeyCondition {
    fn is_lower_bound(&self) -> bool {
        matches!(self.op, BinaryOp::Gt | BinaryOp::Ge)
    }
}

impl fmt::Display for KeyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.value)
    }
}

/// Grouping key of index lookups: lookups with equal pairs run as one scan
#[derive(Debug, Clone, PartialEq)]
pub struct IndexCondPair {
    pub index: String,
    pub key_condition: Vec<KeyCondition>,
    pub additional_range: Option<KeyCondition>,
}

/// How one WHERE branch uses one index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSearchDescriptor {
    pub index: IndexDefinition,
    /// Equality conditions on a prefix of the index fields, optionally closed by
    /// one range condition
    pub key_condition: Vec<KeyCondition>,
    /// Opposite bound of the closing range condition, on the same field
    pub additional_range: Option<KeyCondition>,
    /// Branch conditions the index does not cover
    pub remaining: Option<Expression>,
}

impl IndexSearchDescriptor {
    pub fn cond_pair(&self) -> IndexCondPair {
        IndexCondPair {
            index: self.index.name.clone(),
            key_condition: self.key_condition.clone(),
            additional_range: self.additional_range.clone(),
        }
    }

    fn fields(&self) -> Vec<&str> {
        self.key_condition.iter().map(|c| c.field.as_str()).collect()
    }

    /// Key range to scan, with condition values evaluated against `ctx`
    pub fn range(&self, ctx: &CommandContext) -> ExecutionResult<IndexRange> {
        let empty = Row::new();
        let (equalities, closing) = match self.key_condition.split_last() {
            Some((last, rest)) if last.op.is_range() => (rest, Some(last)),
            _ => (&self.key_condition[..], None),
        };
        let mut prefix = Vec::with_capacity(self.key_condition.len());
        for condition in equalities {
            prefix.push(condition.value.evaluate(&empty, ctx)?.to_property());
        }
        let closing = match closing {
            Some(closing) => closing,
            None => return Ok(IndexRange::prefix(prefix)),
        };

        let mut from = None;
        let mut to = None;
        for condition in std::iter::once(closing).chain(self.additional_range.iter()) {
            let mut key = prefix.clone();
            key.push(condition.value.evaluate(&empty, ctx)?.to_property());
            match condition.op {
                BinaryOp::Gt => from = Some(KeyBound::excluded(key)),
                BinaryOp::Ge => from = Some(KeyBound::included(key)),
                BinaryOp::Lt => to = Some(KeyBound::excluded(key)),
                BinaryOp::Le => to = Some(KeyBound::included(key)),
                _ => {}
            }
        }
        if !prefix.is_empty() {
            from = from.or_else(|| Some(KeyBound::included(prefix.clone())));
            to = to.or_else(|| Some(KeyBound::included(prefix)));
        }
        Ok(IndexRange::between(from, to))
    }
}

impl fmt::Display for IndexSearchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut conditions: Vec<String> = self.key_condition.iter().map(|c| c.to_string()).collect();
        if let Some(additional) = &self.additional_range {
            conditions.push(additional.to_string());
        }
        write!(f, "{} ({})", self.index.name, conditions.join(" AND "))
    }
}

/// Flatten a predicate into OR-ed AND blocks; `None` when it expands past `limit`
fn disjunctive_normal_form(expr: &Expression, limit: usize) -> Option<Vec<Vec<Expression>>> {
    match expr {
        Expression::Binary {
            left,
            op: BinaryOp::Or,
            right,
        } => {
            let mut branches = disjunctive_normal_form(left, limit)?;
            branches.extend(disjunctive_normal_form(right, limit)?);
            (branches.len() <= limit).then_some(branches)
        }
        Expression::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let left = disjunctive_normal_form(left, limit)?;
            let right = disjunctive_normal_form(right, limit)?;
            if left.len() * right.len() > limit {
                return None;
            }
            Some(
                left.iter()
                    .flat_map(|l| {
                        right.iter().map(move |r| {
                            let mut block = l.clone();
                            block.extend(r.iter().cloned());
                            block
                        })
                    })
                    .collect(),
            )
        }
        other => Some(vec![vec![other.clone()]]),
    }
}

fn is_key_operator(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Eq
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::ContainsKey
            | BinaryOp::ContainsValue
    )
}

/// `field <op> constant`, with the operands swapped when the field is on the right
fn key_condition_of(expr: &Expression) -> Option<KeyCondition> {
    let (left, op, right) = match expr {
        Expression::Binary { left, op, right } if is_key_operator(*op) => (left.as_ref(), *op, right.as_ref()),
        _ => return None,
    };
    match (left, right) {
        (Expression::Field(field), value) if !field.starts_with('@') && value.is_row_independent() => {
            Some(KeyCondition {
                field: field.clone(),
                op,
                value: value.clone(),
            })
        }
        (value, Expression::Field(field)) if !field.starts_with('@') && value.is_row_independent() => {
            op.flip().map(|op| KeyCondition {
                field: field.clone(),
                op,
                value: value.clone(),
            })
        }
        _ => None,
    }
}

/// Descriptor for one AND block on one index, if the index can serve it
fn build_descriptor(index: &IndexDefinition, block: &[Expression]) -> Option<IndexSearchDescriptor> {
    let conditions: Vec<Option<KeyCondition>> = block.iter().map(key_condition_of).collect();
    let mut used = vec![false; block.len()];
    let find = |used: &[bool], field: &str, accept: &dyn Fn(&KeyCondition) -> bool| {
        conditions.iter().enumerate().find_map(|(i, c)| match c {
            Some(c) if !used[i] && c.field == field && accept(c) => Some(i),
            _ => None,
        })
    };

    let mut key_condition = Vec::new();
    let mut additional_range = None;
    for field in &index.fields {
        if let Some(by) = field.map_by {
            let selector = match by {
                MapIndexBy::Key => BinaryOp::ContainsKey,
                MapIndexBy::Value => BinaryOp::ContainsValue,
            };
            match find(&used, &field.name, &|c| c.op == selector) {
                Some(i) => {
                    used[i] = true;
                    key_condition.push(conditions[i].clone()?);
                    continue;
                }
                None => break,
            }
        }
        if let Some(i) = find(&used, &field.name, &|c| c.op == BinaryOp::Eq) {
            used[i] = true;
            key_condition.push(conditions[i].clone()?);
            continue;
        }
        if !index.supports_range() {
            break;
        }
        if let Some(i) = find(&used, &field.name, &|c| c.op.is_range()) {
            used[i] = true;
            let closing = conditions[i].clone()?;
            let lower = closing.is_lower_bound();
            if let Some(j) = find(&used, &field.name, &|c| c.op.is_range() && c.is_lower_bound() != lower) {
                used[j] = true;
                additional_range = conditions[j].clone();
            }
            key_condition.push(closing);
        }
        break;
    }

    if key_condition.is_empty() {
        return None;
    }
    if index.kind == IndexKind::Hash
        && (key_condition.len() < index.fields.len() || key_condition.iter().any(|c| c.op.is_range()))
    {
        return None;
    }
    let remaining = Expression::all(
        block
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(expr, _)| expr.clone()),
    );
    Some(IndexSearchDescriptor {
        index: index.clone(),
        key_condition,
        additional_range,
        remaining,
    })
}

/// Drop descriptors whose key fields are a strict prefix of another candidate's
fn prune_redundant(candidates: Vec<IndexSearchDescriptor>) -> Vec<IndexSearchDescriptor> {
    let redundant: Vec<bool> = candidates
        .iter()
        .map(|d| {
            let fields = d.fields();
            candidates.iter().any(|other| {
                let other_fields = other.fields();
                other_fields.len() > fields.len() && other_fields.starts_with(&fields)
            })
        })
        .collect();
    candidates
        .into_iter()
        .zip(redundant)
        .filter(|(_, redundant)| !redundant)
        .map(|(d, _)| d)
        .collect()
}

/// Planner for record-fetching statements
#[derive(Debug, Clone)]
pub struct SelectPlanner {
    max_branches: usize,
}

impl Default for SelectPlanner {
    fn default() -> Self {
        SelectPlanner {
            max_branches: MAX_WHERE_BRANCHES,
        }
    }
}

impl SelectPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_branches(max_branches: usize) -> Self {
        SelectPlanner { max_branches }
    }

    /// Index lookups serving every branch of `condition`, one per branch;
    /// `None` when some branch cannot use an index
    pub fn index_descriptors(
        &self,
        indexes: &[IndexDefinition],
        condition: &Expression,
    ) -> Option<Vec<IndexSearchDescriptor>> {
        if indexes.is_empty() {
            return None;
        }
        let branches = disjunctive_normal_form(condition, self.max_branches)?;

        let candidates: Vec<Vec<IndexSearchDescriptor>> = branches
            .iter()
            .map(|block| prune_redundant(indexes.iter().filter_map(|i| build_descriptor(i, block)).collect()))
            .collect();

        let mut served: FxHashMap<&str, usize> = FxHashMap::default();
        for descriptors in &candidates {
            for d in descriptors {
                *served.entry(d.index.name.as_str()).or_default() += 1;
            }
        }
        let declared = |name: &str| indexes.iter().position(|i| i.name == name).unwrap_or(usize::MAX);

        let mut chosen = Vec::with_capacity(candidates.len());
        for (block, descriptors) in branches.iter().zip(&candidates) {
            let wants_range = block
                .iter()
                .filter_map(key_condition_of)
                .any(|c| c.op.is_range());
            let best = descriptors.iter().min_by_key(|d| {
                (
                    std::cmp::Reverse(d.key_condition.len()),
                    std::cmp::Reverse(served.get(d.index.name.as_str()).copied().unwrap_or(0)),
                    !(wants_range && d.index.supports_range()),
                    declared(&d.index.name),
                )
            })?;
            chosen.push(best.clone());
        }
        Some(chosen)
    }

    /// Group descriptors by index and key conditions, OR-ing their residuals.
    /// A member without a residual makes the group's residual always pass.
    pub fn group_descriptors(
        descriptors: Vec<IndexSearchDescriptor>,
    ) -> Vec<(IndexSearchDescriptor, Option<Expression>)> {
        let mut groups: Vec<(IndexCondPair, IndexSearchDescriptor, Vec<Option<Expression>>)> = Vec::new();
        for descriptor in descriptors {
            let pair = descriptor.cond_pair();
            let residual = descriptor.remaining.clone();
            match groups.iter_mut().find(|(p, _, _)| *p == pair) {
                Some((_, _, residuals)) => residuals.push(residual),
                None => groups.push((pair, descriptor, vec![residual])),
            }
        }
        groups
            .into_iter()
            .map(|(_, mut descriptor, residuals)| {
                let residual = if residuals.iter().any(Option::is_none) {
                    None
                } else {
                    Expression::any(residuals.into_iter().flatten())
                };
                descriptor.remaining = residual.clone();
                (descriptor, residual)
            })
            .collect()
    }

    /// Index usable to return a whole class in ORDER BY order without sorting
    fn sort_index(indexes: &[IndexDefinition], order_by: &[OrderByItem]) -> Option<(IndexDefinition, bool)> {
        let ascending = order_by.first()?.ascending;
        let mut fields = Vec::with_capacity(order_by.len());
        for item in order_by {
            match &item.expression {
                Expression::Field(name) if item.ascending == ascending => fields.push(name.as_str()),
                _ => return None,
            }
        }
        indexes
            .iter()
            .find(|index| {
                index.supports_range()
                    && index.fields.len() >= fields.len()
                    && index
                        .fields
                        .iter()
                        .zip(&fields)
                        .all(|(f, name)| f.map_by.is_none() && f.name == *name)
            })
            .map(|index| (index.clone(), ascending))
    }

    /// Chain the steps that fetch the records of `class` matching `condition`.
    /// Returns true when the chained steps already emit rows in `order_by` order.
    fn chain_class_fetch(
        &self,
        plan: &mut SelectExecutionPlan,
        class: &str,
        condition: Option<&Expression>,
        order_by: &[OrderByItem],
        ctx: &CommandContext,
    ) -> ExecutionResult<bool> {
        let session = ctx.session();
        if !session.class_exists(class) {
            return Err(ExecutionError::PlanningError(format!("Class not found: {}", class)));
        }
        if session.count_class(class)? == 0 {
            plan.chain(ExecutionStep::new(StepKind::Empty {
                reason: format!("class {} is empty", class),
            }));
            return Ok(true);
        }
        let indexes = session.indexes_for_class(class);
        let classes = vec![class.to_string()];

        let condition = match condition {
            Some(condition) => condition,
            None => {
                if let Some((index, ascending)) = Self::sort_index(&indexes, order_by) {
                    debug!("Ordering {} through index {}", class, index.name);
                    plan.chain(ExecutionStep::new(StepKind::FetchFromIndexValues { index, ascending }));
                    plan.chain(ExecutionStep::new(StepKind::GetValueFromIndexEntry { classes }));
                    return Ok(true);
                }
                plan.chain(ExecutionStep::new(StepKind::FetchFromClass {
                    class: class.to_string(),
                    ascending: true,
                }));
                return Ok(false);
            }
        };

        let descriptors = match self.index_descriptors(&indexes, condition) {
            Some(descriptors) => descriptors,
            None => {
                debug!("No index serves every branch of {}; scanning class {}", condition, class);
                plan.chain(ExecutionStep::new(StepKind::FetchFromClass {
                    class: class.to_string(),
                    ascending: true,
                }));
                plan.chain(ExecutionStep::new(StepKind::Filter {
                    predicate: condition.clone(),
                }));
                return Ok(false);
            }
        };

        let groups = Self::group_descriptors(descriptors);
        debug!("Fetching {} through {} index scan(s)", class, groups.len());
        let index_steps = |descriptor: IndexSearchDescriptor, residual: Option<Expression>| {
            let mut steps = vec![
                ExecutionStep::new(StepKind::FetchFromIndex {
                    descriptor,
                    ascending: true,
                }),
                ExecutionStep::new(StepKind::GetValueFromIndexEntry {
                    classes: classes.clone(),
                }),
            ];
            if let Some(predicate) = residual {
                steps.push(ExecutionStep::new(StepKind::Filter { predicate }));
            }
            steps
        };

        if groups.len() == 1 {
            for (descriptor, residual) in groups {
                for step in index_steps(descriptor, residual) {
                    plan.chain(step);
                }
            }
        } else {
            let mut sub_plans = Vec::with_capacity(groups.len());
            for (descriptor, residual) in groups {
                let mut sub_plan = SelectExecutionPlan::new();
                for step in index_steps(descriptor, residual) {
                    sub_plan.chain(step);
                }
                sub_plans.push(sub_plan);
            }
            plan.chain(ExecutionStep::new(StepKind::ChainSubPlans { plans: sub_plans }));
            plan.chain(ExecutionStep::new(StepKind::Distinct));
        }
        Ok(false)
    }

    /// Source steps of a SELECT-like statement, its WHERE clause included.
    /// Returns true when rows already come out in `order_by` order.
    pub fn chain_fetch(
        &self,
        plan: &mut SelectExecutionPlan,
        target: &SelectTarget,
        condition: Option<&Expression>,
        order_by: &[OrderByItem],
        ctx: &CommandContext,
    ) -> ExecutionResult<bool> {
        let ordered = match target {
            SelectTarget::Class(class) => return self.chain_class_fetch(plan, class, condition, order_by, ctx),
            SelectTarget::Rids(rids) => {
                plan.chain(ExecutionStep::new(StepKind::FetchFromRids { rids: rids.clone() }));
                false
            }
            SelectTarget::Variable(name) => {
                plan.chain(ExecutionStep::new(StepKind::FetchFromVariable { name: name.clone() }));
                false
            }
        };
        if let Some(predicate) = condition {
            plan.chain(ExecutionStep::new(StepKind::Filter {
                predicate: predicate.clone(),
            }));
        }
        Ok(ordered)
    }

    pub fn plan_select(&self, statement: &SelectStatement, ctx: &CommandContext) -> ExecutionResult<SelectExecutionPlan> {
        let mut plan = SelectExecutionPlan::new();
        // Everything from the first row-dependent LET on is evaluated per row
        let split = statement
            .let_clauses
            .iter()
            .position(|(_, expression)| !expression.is_row_independent())
            .unwrap_or(statement.let_clauses.len());
        let (global, per_row) = statement.let_clauses.split_at(split);
        for (name, expression) in global {
            plan.chain(ExecutionStep::new(StepKind::GlobalLet {
                name: name.clone(),
                expression: expression.clone(),
            }));
        }
        let condition = if per_row.is_empty() {
            statement.where_clause.as_ref()
        } else {
            None
        };
        let ordered = self.chain_fetch(&mut plan, &statement.target, condition, &statement.order_by, ctx)?;
        if !per_row.is_empty() {
            for (name, expression) in per_row {
                plan.chain(ExecutionStep::new(StepKind::Let {
                    name: name.clone(),
                    expression: expression.clone(),
                }));
            }
            if let Some(predicate) = &statement.where_clause {
                plan.chain(ExecutionStep::new(StepKind::Filter {
                    predicate: predicate.clone(),
                }));
            }
        }
        if !ordered && !statement.order_by.is_empty() {
            plan.chain(ExecutionStep::new(StepKind::OrderBy {
                items: statement.order_by.clone(),
            }));
        }
        if !statement.projection.is_empty() {
            plan.chain(ExecutionStep::new(StepKind::Projection {
                items: statement.projection.clone(),
            }));
        }
        if statement.distinct {
            plan.chain(ExecutionStep::new(StepKind::Distinct));
        }
        if let Some(field) = &statement.unwind {
            plan.chain(ExecutionStep::new(StepKind::Unroll { field: field.clone() }));
        }
        if let Some(skip) = statement.skip {
            plan.chain(ExecutionStep::new(StepKind::Skip(skip)));
        }
        if let Some(limit) = statement.limit {
            plan.chain(ExecutionStep::new(StepKind::Limit(limit)));
        }
        plan.set_profiling(ctx.is_profiling());
        Ok(plan)
    }

    pub fn plan_delete(&self, statement: &DeleteStatement, ctx: &CommandContext) -> ExecutionResult<UpdateExecutionPlan> {
        let mut plan = SelectExecutionPlan::new();
        let target = SelectTarget::Class(statement.class.clone());
        self.chain_fetch(&mut plan, &target, statement.where_clause.as_ref(), &[], ctx)?;
        match statement.kind {
            DeleteKind::Vertex => plan.chain(ExecutionStep::new(StepKind::CastToVertex)),
            DeleteKind::Edge => plan.chain(ExecutionStep::new(StepKind::CastToEdge)),
            DeleteKind::Any => {}
        }
        plan.chain(ExecutionStep::new(StepKind::Delete));
        if let Some(size) = &statement.batch_size {
            plan.chain(ExecutionStep::batch_commit(size, ctx)?);
        }
        plan.set_profiling(ctx.is_profiling());
        Ok(UpdateExecutionPlan::new(plan))
    }

    pub fn plan_update(&self, statement: &UpdateStatement, ctx: &CommandContext) -> ExecutionResult<UpdateExecutionPlan> {
        let mut plan = SelectExecutionPlan::new();
        let target = SelectTarget::Class(statement.class.clone());
        self.chain_fetch(&mut plan, &target, statement.where_clause.as_ref(), &[], ctx)?;
        if let Some(limit) = statement.limit {
            plan.chain(ExecutionStep::new(StepKind::Limit(limit)));
        }
        plan.chain(ExecutionStep::new(StepKind::ConvertToUpdatable));
        if statement.return_before {
            plan.chain(ExecutionStep::new(StepKind::CopyRecordBeforeUpdate));
        }
        for operation in &statement.operations {
            let kind = match operation {
                UpdateOperation::Set(items) => StepKind::UpdateSet { items: items.clone() },
                UpdateOperation::Remove(fields) => StepKind::UpdateRemove { fields: fields.clone() },
                UpdateOperation::Merge(document) => StepKind::UpdateMerge {
                    document: document.clone(),
                },
                UpdateOperation::Content(document) => StepKind::UpdateContent {
                    document: document.clone(),
                },
            };
            plan.chain(ExecutionStep::new(kind));
        }
        plan.chain(ExecutionStep::new(StepKind::Save));
        if let Some(size) = &statement.batch_size {
            plan.chain(ExecutionStep::batch_commit(size, ctx)?);
        }
        if statement.return_before {
            plan.chain(ExecutionStep::new(StepKind::UnwrapPreviousValue));
        } else {
            plan.chain(ExecutionStep::new(StepKind::ConvertToResult));
        }
        plan.set_profiling(ctx.is_profiling());
        Ok(UpdateExecutionPlan::new(plan))
    }

    pub fn plan_insert(&self, statement: &InsertStatement, ctx: &CommandContext) -> ExecutionResult<UpdateExecutionPlan> {
        if !ctx.session().class_exists(&statement.class) {
            return Err(ExecutionError::PlanningError(format!("Class not found: {}", statement.class)));
        }
        let mut plan = SelectExecutionPlan::new();
        plan.chain(ExecutionStep::new(StepKind::CreateRecord {
            class: statement.class.clone(),
            count: statement.rows.len().max(1),
        }));
        if !statement.rows.is_empty() {
            plan.chain(ExecutionStep::new(StepKind::InsertValues {
                columns: statement.columns.clone(),
                rows: statement.rows.clone(),
            }));
        }
        plan.chain(ExecutionStep::new(StepKind::Save));
        plan.chain(ExecutionStep::new(StepKind::ConvertToResult));
        plan.set_profiling(ctx.is_profiling());
        Ok(UpdateExecutionPlan::new(plan))
    }

    /// `FOR EACH variable IN source { body }`
    pub fn plan_for_each(
        &self,
        variable: &str,
        source: Expression,
        body: SelectExecutionPlan,
        ctx: &CommandContext,
    ) -> UpdateExecutionPlan {
        let mut plan = SelectExecutionPlan::new();
        plan.chain(ExecutionStep::new(StepKind::ForEach {
            variable: variable.to_string(),
            source,
            body,
        }));
        plan.set_profiling(ctx.is_profiling());
        UpdateExecutionPlan::new(plan)
    }

    /// Run `body` once per row of `source` with `$current` bound to that row;
    /// the rows of each run replace the source row
    pub fn plan_while_match(
        &self,
        source: SelectExecutionPlan,
        body: SelectExecutionPlan,
        ctx: &CommandContext,
    ) -> SelectExecutionPlan {
        let mut plan = source;
        plan.chain(ExecutionStep::new(StepKind::WhileMatch { body }));
        plan.set_profiling(ctx.is_profiling());
        plan
    }

    /// Run `body` transactionally, re-running it on conflicts up to `retries` times
    pub fn plan_retry(&self, body: SelectExecutionPlan, retries: usize, ctx: &CommandContext) -> UpdateExecutionPlan {
        let mut plan = SelectExecutionPlan::new();
        plan.chain(ExecutionStep::new(StepKind::Retry { body, retries }));
        plan.set_profiling(ctx.is_profiling());
        UpdateExecutionPlan::new(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{MemoryDatabase, PropertyValue};
    use crate::query::ast::ProjectionItem;
    use crate::query::executor::record::Value;
    use std::sync::Arc;

    fn ab_index(kind: IndexKind) -> IndexDefinition {
        IndexDefinition::new("Item.a_b", "Item", &["a", "b"], kind)
    }

    fn range_branch(extra: Option<Expression>) -> Expression {
        let mut conditions = vec![
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Ge, 2i64),
            Expression::compare("b", BinaryOp::Lt, 5i64),
        ];
        conditions.extend(extra);
        Expression::all(conditions).unwrap()
    }

    fn items() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new();
        db.create_class("Item", None).unwrap();
        for a in 0..3i64 {
            for b in 0..7i64 {
                db.insert_document("Item", [("a", a), ("b", b), ("c", a * 10 + b)]).unwrap();
            }
        }
        db.create_index(ab_index(IndexKind::NotUnique)).unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_dnf_expansion_and_limit() {
        let expr = Expression::and(
            Expression::or(
                Expression::compare("a", BinaryOp::Eq, 1i64),
                Expression::compare("a", BinaryOp::Eq, 2i64),
            ),
            Expression::compare("b", BinaryOp::Eq, 3i64),
        );
        let branches = disjunctive_normal_form(&expr, 8).unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].len(), 2);
        assert!(disjunctive_normal_form(&expr, 1).is_none());
    }

    #[test]
    fn test_descriptor_prefix_and_ranges() {
        let block = vec![
            Expression::compare("b", BinaryOp::Lt, 5i64),
            Expression::binary(Expression::literal(1i64), BinaryOp::Eq, Expression::field("a")),
            Expression::compare("b", BinaryOp::Ge, 2i64),
            Expression::compare("c", BinaryOp::Eq, 9i64),
        ];
        let descriptor = build_descriptor(&ab_index(IndexKind::NotUnique), &block).unwrap();
        let fields: Vec<(&str, BinaryOp)> = descriptor
            .key_condition
            .iter()
            .map(|c| (c.field.as_str(), c.op))
            .collect();
        assert_eq!(fields, vec![("a", BinaryOp::Eq), ("b", BinaryOp::Lt)]);
        assert_eq!(descriptor.additional_range.as_ref().map(|c| c.op), Some(BinaryOp::Ge));
        assert_eq!(descriptor.remaining, Some(Expression::compare("c", BinaryOp::Eq, 9i64)));
    }

    #[test]
    fn test_hash_index_needs_full_key() {
        let hash = ab_index(IndexKind::Hash);
        assert!(build_descriptor(&hash, &[Expression::compare("a", BinaryOp::Eq, 1i64)]).is_none());
        let full = [
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Eq, 2i64),
        ];
        assert!(build_descriptor(&hash, &full).is_some());
        let ranged = [
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Gt, 2i64),
        ];
        assert!(build_descriptor(&hash, &ranged).is_none());
    }

    #[test]
    fn test_map_selector_routing() {
        let by_key = IndexDefinition::on_map("Doc.tags.key", "Doc", "tags", MapIndexBy::Key, IndexKind::NotUnique);
        let by_value = IndexDefinition::on_map("Doc.tags.value", "Doc", "tags", MapIndexBy::Value, IndexKind::NotUnique);
        let key_branch = [Expression::compare("tags", BinaryOp::ContainsKey, "red")];
        let value_branch = [Expression::compare("tags", BinaryOp::ContainsValue, "red")];
        assert!(build_descriptor(&by_key, &key_branch).is_some());
        assert!(build_descriptor(&by_key, &value_branch).is_none());
        assert!(build_descriptor(&by_value, &value_branch).is_some());
        assert!(build_descriptor(&by_value, &key_branch).is_none());
    }

    #[test]
    fn test_longer_prefix_wins() {
        let a_only = IndexDefinition::new("Item.a", "Item", &["a"], IndexKind::NotUnique);
        let planner = SelectPlanner::new();
        let condition = Expression::and(
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Eq, 2i64),
        );
        let chosen = planner
            .index_descriptors(&[a_only, ab_index(IndexKind::NotUnique)], &condition)
            .unwrap();
        assert_eq!(chosen[0].index.name, "Item.a_b");
        assert!(chosen[0].remaining.is_none());
    }

    #[test]
    fn test_grouping_merges_identical_pairs_only() {
        let planner = SelectPlanner::new();
        let index = ab_index(IndexKind::NotUnique);
        let same = Expression::or(
            range_branch(Some(Expression::compare("c", BinaryOp::Eq, 9i64))),
            range_branch(Some(Expression::compare("c", BinaryOp::Eq, 8i64))),
        );
        let descriptors = planner.index_descriptors(std::slice::from_ref(&index), &same).unwrap();
        let groups = SelectPlanner::group_descriptors(descriptors);
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].1,
            Some(Expression::or(
                Expression::compare("c", BinaryOp::Eq, 9i64),
                Expression::compare("c", BinaryOp::Eq, 8i64)
            ))
        );

        let different = Expression::or(
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("a", BinaryOp::Eq, 2i64),
        );
        let descriptors = planner.index_descriptors(&[index], &different).unwrap();
        assert_eq!(SelectPlanner::group_descriptors(descriptors).len(), 2);
    }

    #[test]
    fn test_range_evaluation() {
        let ctx = CommandContext::new(items());
        let descriptor = build_descriptor(&ab_index(IndexKind::NotUnique), &[
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Gt, 2i64),
        ])
        .unwrap();
        let range = descriptor.range(&ctx).unwrap();
        assert_eq!(
            range.from,
            Some(KeyBound::excluded(vec![PropertyValue::from(1i64), PropertyValue::from(2i64)]))
        );
        assert_eq!(range.to, Some(KeyBound::included(vec![PropertyValue::from(1i64)])));
    }

    #[test]
    fn test_select_single_scan_without_filter() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let statement = SelectStatement::from_class("Item").filter(Expression::or(
            range_branch(None),
            range_branch(Some(Expression::compare("c", BinaryOp::Eq, 9i64))),
        ));
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        let kinds: Vec<&StepKind> = plan.steps().iter().map(|s| s.kind()).collect();
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], StepKind::FetchFromIndex { .. }));
        assert!(matches!(kinds[1], StepKind::GetValueFromIndexEntry { .. }));
        let rows = plan.execute_to_vec(&mut ctx).unwrap();
        let bs: Vec<Value> = rows.iter().map(|r| r.property("b")).collect();
        assert_eq!(bs, vec![Value::from(2i64), Value::from(3i64), Value::from(4i64)]);
    }

    #[test]
    fn test_select_multiple_groups_are_chained_and_distinct() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let statement = SelectStatement::from_class("Item").filter(Expression::or(
            Expression::and(
                Expression::compare("a", BinaryOp::Eq, 0i64),
                Expression::compare("b", BinaryOp::Eq, 1i64),
            ),
            Expression::and(
                Expression::compare("a", BinaryOp::Eq, 2i64),
                Expression::compare("b", BinaryOp::Le, 1i64),
            ),
        ));
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        let kinds: Vec<&StepKind> = plan.steps().iter().map(|s| s.kind()).collect();
        assert!(matches!(kinds[0], StepKind::ChainSubPlans { plans } if plans.len() == 2));
        assert!(matches!(kinds[1], StepKind::Distinct));
        assert_eq!(plan.execute_to_vec(&mut ctx).unwrap().len(), 3);
    }

    #[test]
    fn test_fallback_to_class_scan() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let statement = SelectStatement::from_class("Item").filter(Expression::or(
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("c", BinaryOp::Eq, 3i64),
        ));
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        let kinds: Vec<&StepKind> = plan.steps().iter().map(|s| s.kind()).collect();
        assert!(matches!(kinds[0], StepKind::FetchFromClass { .. }));
        assert!(matches!(kinds[1], StepKind::Filter { .. }));
        assert_eq!(plan.execute_to_vec(&mut ctx).unwrap().len(), 8);
    }

    #[test]
    fn test_sort_only_index_scan() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let mut statement = SelectStatement::from_class("Item").order_by("a", false).order_by("b", false);
        statement.limit = Some(2);
        statement.projection = vec![ProjectionItem::new(Expression::field("c"), "c")];
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        assert!(matches!(
            plan.steps()[0].kind(),
            StepKind::FetchFromIndexValues { ascending: false, .. }
        ));
        assert!(!plan.steps().iter().any(|s| matches!(s.kind(), StepKind::OrderBy { .. })));
        assert!(!plan.can_be_cached());
        let rows = plan.execute_to_vec(&mut ctx).unwrap();
        let cs: Vec<Value> = rows.iter().map(|r| r.property("c")).collect();
        assert_eq!(cs, vec![Value::from(26i64), Value::from(25i64)]);
    }

    #[test]
    fn test_empty_class_plans_empty_step() {
        let db = MemoryDatabase::new();
        db.create_class("Nothing", None).unwrap();
        let ctx = CommandContext::new(Arc::new(db));
        let plan = SelectPlanner::new()
            .plan_select(&SelectStatement::from_class("Nothing"), &ctx)
            .unwrap();
        assert!(matches!(plan.steps()[0].kind(), StepKind::Empty { .. }));
        assert!(!plan.can_be_cached());
        let missing = SelectPlanner::new().plan_select(&SelectStatement::from_class("Missing"), &ctx);
        assert!(matches!(missing, Err(ExecutionError::PlanningError(_))));
    }

    #[test]
    fn test_index_keys_use_let_variables() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let mut statement = SelectStatement::from_class("Item").filter(Expression::and(
            Expression::binary(Expression::field("a"), BinaryOp::Eq, Expression::variable("$a")),
            Expression::compare("b", BinaryOp::Eq, 6i64),
        ));
        statement.let_clauses = vec![("$a".to_string(), Expression::literal(2i64))];
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        assert!(matches!(plan.steps()[0].kind(), StepKind::GlobalLet { .. }));
        let rows = plan.execute_to_vec(&mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property("c"), Value::from(26i64));
    }

    #[test]
    fn test_row_dependent_let_runs_per_row() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let mut statement = SelectStatement::from_class("Item").filter(Expression::and(
            Expression::compare("a", BinaryOp::Eq, 2i64),
            Expression::binary(Expression::variable("$double"), BinaryOp::Gt, Expression::literal(50i64)),
        ));
        statement.let_clauses = vec![
            ("$factor".to_string(), Expression::literal(2i64)),
            (
                "$double".to_string(),
                Expression::binary(Expression::field("c"), BinaryOp::Mul, Expression::variable("$factor")),
            ),
        ];
        let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
        let kinds: Vec<&str> = plan.steps().iter().map(|s| s.name()).collect();
        assert_eq!(
            kinds,
            vec!["LET (once)", "FETCH FROM CLASS", "LET (for each record)", "FILTER ITEMS WHERE"]
        );
        let rows = plan.execute_to_vec(&mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property("c"), Value::from(26i64));
        assert_eq!(rows[0].metadata("$double"), Some(&Value::from(52i64)));
    }

    #[test]
    fn test_while_match_reruns_body_per_row() {
        let db = items();
        let mut ctx = CommandContext::new(db);
        let planner = SelectPlanner::new();
        let source = planner
            .plan_select(
                &SelectStatement::from_class("Item").filter(Expression::compare("a", BinaryOp::Eq, 0i64)),
                &ctx,
            )
            .unwrap();
        let mut body = SelectStatement::from_class("Item");
        body.target = SelectTarget::Variable("$current".to_string());
        body.projection = vec![ProjectionItem::new(
            Expression::binary(Expression::field("c"), BinaryOp::Add, Expression::literal(100i64)),
            "shifted",
        )];
        let body = planner.plan_select(&body, &ctx).unwrap();
        let plan = planner.plan_while_match(source, body, &ctx);
        assert_eq!(plan.last_step().map(|s| s.name()), Some("WHILE MATCH"));

        let rows = plan.execute_to_vec(&mut ctx).unwrap();
        let shifted: Vec<Value> = rows.iter().map(|r| r.property("shifted")).collect();
        assert_eq!(shifted, (100..107i64).map(Value::from).collect::<Vec<_>>());
        assert!(ctx.variable("$current").is_none());
    }
}
