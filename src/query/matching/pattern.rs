//! MATCH pattern graph
//!
//! Aliases are nodes, path items are directed edges. Nodes and edges live in
//! arenas and refer to each other by index, so a pattern is plain data that
//! can be split into connected components and cloned freely.

use crate::graph::{DataSession, RecordId};
use crate::query::ast::{Expression, MatchExpression, MatchFilter, MatchPathItem};
use crate::query::executor::{ExecutionError, ExecutionResult};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Prefix of the aliases generated for anonymous pattern nodes
pub const DEFAULT_ALIAS_PREFIX: &str = "$DEFAULT_ALIAS_";

/// Aliases starting with `$` are generated or reserved
pub fn is_user_alias(alias: &str) -> bool {
    !alias.starts_with('$')
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternNode {
    pub alias: String,
    pub optional: bool,
    pub out_edges: Vec<usize>,
    pub in_edges: Vec<usize>,
}

impl PatternNode {
    fn new(alias: &str) -> Self {
        PatternNode {
            alias: alias.to_string(),
            optional: false,
            out_edges: Vec::new(),
            in_edges: Vec::new(),
        }
    }
}

/// A path item connecting two aliases; `item.filter` describes the target
#[derive(Debug, Clone, PartialEq)]
pub struct PatternEdge {
    pub from: usize,
    pub to: usize,
    pub item: MatchPathItem,
}

impl PatternEdge {
    /// The endpoint opposite to `node`
    pub fn other(&self, node: usize) -> usize {
        if self.from == node {
            self.to
        } else {
            self.from
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pattern {
    nodes: Vec<PatternNode>,
    edges: Vec<PatternEdge>,
    index: FxHashMap<String, usize>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pattern of expressions whose every filter already carries an alias
    pub fn from_expressions(expressions: &[MatchExpression]) -> ExecutionResult<Self> {
        let mut pattern = Pattern::new();
        for expression in expressions {
            let mut previous = pattern.add_filter(&expression.origin)?;
            for item in &expression.items {
                let next = pattern.add_filter(&item.filter)?;
                pattern.add_edge(previous, next, item.clone());
                previous = next;
            }
        }
        Ok(pattern)
    }

    fn add_filter(&mut self, filter: &MatchFilter) -> ExecutionResult<usize> {
        let alias = filter
            .alias
            .as_deref()
            .ok_or_else(|| ExecutionError::PlanningError("MATCH filter without an alias".to_string()))?;
        let id = self.add_node(alias);
        if filter.optional {
            self.nodes[id].optional = true;
        }
        Ok(id)
    }

    /// Node for `alias`, created on first use
    pub fn add_node(&mut self, alias: &str) -> usize {
        if let Some(&id) = self.index.get(alias) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(PatternNode::new(alias));
        self.index.insert(alias.to_string(), id);
        id
    }

    pub fn add_edge(&mut self, from: usize, to: usize, item: MatchPathItem) -> usize {
        let id = self.edges.len();
        self.edges.push(PatternEdge { from, to, item });
        self.nodes[from].out_edges.push(id);
        self.nodes[to].in_edges.push(id);
        id
    }

    pub fn node(&self, id: usize) -> &PatternNode {
        &self.nodes[id]
    }

    pub fn edge(&self, id: usize) -> &PatternEdge {
        &self.edges[id]
    }

    pub fn nodes(&self) -> &[PatternNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[PatternEdge] {
        &self.edges
    }

    pub fn find(&self, alias: &str) -> Option<usize> {
        self.index.get(alias).copied()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.alias.as_str())
    }

    /// Edges touching `node`: outgoing first, then incoming
    pub fn incident_edges(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        let node = &self.nodes[node];
        node.out_edges.iter().chain(node.in_edges.iter()).copied()
    }

    pub fn has_optional(&self) -> bool {
        self.nodes.iter().any(|n| n.optional)
    }

    /// Connected components, ignoring edge direction, in order of first appearance
    pub fn components(&self) -> Vec<Pattern> {
        let mut component_of: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut count = 0;
        for start in 0..self.nodes.len() {
            if component_of[start].is_some() {
                continue;
            }
            let mut stack = vec![start];
            component_of[start] = Some(count);
            while let Some(node) = stack.pop() {
                for edge in self.incident_edges(node) {
                    let other = self.edges[edge].other(node);
                    if component_of[other].is_none() {
                        component_of[other] = Some(count);
                        stack.push(other);
                    }
                }
            }
            count += 1;
        }

        let mut components = vec![Pattern::new(); count];
        let mut local = vec![0usize; self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(c) = component_of[id] {
                local[id] = components[c].add_node(&node.alias);
                components[c].nodes[local[id]].optional = node.optional;
            }
        }
        for edge in &self.edges {
            if let Some(c) = component_of[edge.from] {
                components[c].add_edge(local[edge.from], local[edge.to], edge.item.clone());
            }
        }
        components
    }

    /// Optional nodes must be reached from the rest of the pattern and must
    /// not lead anywhere themselves
    pub fn validate(&self) -> ExecutionResult<()> {
        for node in self.nodes.iter().filter(|n| n.optional) {
            if !node.out_edges.is_empty() {
                return Err(ExecutionError::PlanningError(format!(
                    "Optional alias {} cannot have outgoing edges",
                    node.alias
                )));
            }
            if node.in_edges.is_empty() {
                return Err(ExecutionError::PlanningError(format!(
                    "Optional alias {} is not connected to the pattern",
                    node.alias
                )));
            }
        }
        Ok(())
    }
}

/// Give every anonymous filter a generated alias; one counter spans all expressions
pub fn assign_default_aliases(expressions: &[MatchExpression]) -> Vec<MatchExpression> {
    let mut counter = 0usize;
    let mut name = |filter: &mut MatchFilter| {
        if filter.alias.is_none() {
            filter.alias = Some(format!("{}{}", DEFAULT_ALIAS_PREFIX, counter));
            counter += 1;
        }
    };
    expressions
        .iter()
        .map(|expression| {
            let mut expression = expression.clone();
            name(&mut expression.origin);
            for item in &mut expression.items {
                name(&mut item.filter);
            }
            expression
        })
        .collect()
}

/// Class, record and WHERE constraints of one alias, merged across all of
/// its occurrences in the statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasConstraints {
    pub class: Option<String>,
    pub rid: Option<RecordId>,
    pub filter: Option<Expression>,
}

impl AliasConstraints {
    fn merge(&mut self, alias: &str, filter: &MatchFilter, session: &dyn DataSession) -> ExecutionResult<()> {
        if let Some(condition) = &filter.where_clause {
            self.filter = Some(match self.filter.take() {
                Some(existing) => Expression::and(existing, condition.clone()),
                None => condition.clone(),
            });
        }
        if let Some(class) = &filter.class {
            self.class = Some(match self.class.take() {
                None => class.clone(),
                Some(existing) if session.is_subclass_of(class, &existing) => class.clone(),
                Some(existing) if session.is_subclass_of(&existing, class) => existing,
                Some(existing) => {
                    return Err(ExecutionError::PlanningError(format!(
                        "Classes defined for alias {} ({}, {}) are not in the same hierarchy",
                        alias, existing, class
                    )))
                }
            });
        }
        if let Some(rid) = filter.rid {
            match self.rid {
                Some(existing) if existing != rid => {
                    return Err(ExecutionError::PlanningError(format!(
                        "Alias {} is bound to two records ({}, {})",
                        alias, existing, rid
                    )))
                }
                _ => self.rid = Some(rid),
            }
        }
        Ok(())
    }
}

/// Constraints per alias, in order of first appearance
pub fn collect_constraints(
    expressions: &[MatchExpression],
    session: &dyn DataSession,
) -> ExecutionResult<IndexMap<String, AliasConstraints>> {
    let mut constraints: IndexMap<String, AliasConstraints> = IndexMap::new();
    let filters = expressions
        .iter()
        .flat_map(|e| std::iter::once(&e.origin).chain(e.items.iter().map(|i| &i.filter)));
    for filter in filters {
        if let Some(alias) = &filter.alias {
            constraints
                .entry(alias.clone())
                .or_default()
                .merge(alias, filter, session)?;
        }
    }
    Ok(constraints)
}
