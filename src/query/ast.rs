//! Typed statement and expression trees
//!
//! Statements reach the engine already parsed. These types are what the
//! planners consume: SELECT/UPDATE/DELETE/INSERT targets with their
//! predicates, and MATCH patterns made of node filters and path items.

use crate::graph::{PropertyValue, RecordId};
use std::fmt;

/// Expression evaluated against a row and the command context
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(PropertyValue),
    /// Property of the row being evaluated: `name`
    Field(String),
    /// Context variable: `$current`, `$depth`, `$matched`, LET names
    Variable(String),
    /// Statement parameter: `:name`
    Parameter(String),
    /// Property of another value: `base.name`
    Property { base: Box<Expression>, name: String },
    Binary {
        left: Box<Expression>,
        op: BinaryOp,
        right: Box<Expression>,
    },
    Unary { op: UnaryOp, expr: Box<Expression> },
    Function { name: String, args: Vec<Expression> },
    List(Vec<Expression>),
    /// Relation hop from a record-valued base: `base.out('Knows')`
    Traverse { base: Box<Expression>, method: PathMethod },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    StartsWith,
    EndsWith,
    Contains,
    In,
    /// Map field holds the key
    ContainsKey,
    /// Map field holds the value
    ContainsValue,
    RegexMatch,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::StartsWith => "STARTS WITH",
            BinaryOp::EndsWith => "ENDS WITH",
            BinaryOp::Contains => "CONTAINS",
            BinaryOp::In => "IN",
            BinaryOp::ContainsKey => "CONTAINSKEY",
            BinaryOp::ContainsValue => "CONTAINSVALUE",
            BinaryOp::RegexMatch => "=~",
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }

    /// Operator with operands swapped: `1 < a` is `a > 1`
    pub fn flip(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::Le => Some(BinaryOp::Ge),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::Ge => Some(BinaryOp::Le),
            _ => None,
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Minus,
    IsNull,
    IsNotNull,
}

impl Expression {
    pub fn literal(value: impl Into<PropertyValue>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Expression::Field(name.into())
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Expression::Variable(name.into())
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Expression::Parameter(name.into())
    }

    pub fn binary(left: Expression, op: BinaryOp, right: Expression) -> Self {
        Expression::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// `field <op> value` with a literal right side
    pub fn compare(field: &str, op: BinaryOp, value: impl Into<PropertyValue>) -> Self {
        Expression::binary(Expression::field(field), op, Expression::literal(value))
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::binary(left, BinaryOp::And, right)
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::binary(left, BinaryOp::Or, right)
    }

    pub fn not(expr: Expression) -> Self {
        Expression::Unary {
            op: UnaryOp::Not,
            expr: Box::new(expr),
        }
    }

    /// Fold a list of conditions with AND; `None` when empty
    pub fn all(conditions: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        conditions.into_iter().reduce(Expression::and)
    }

    /// Fold a list of conditions with OR; `None` when empty
    pub fn any(conditions: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        conditions.into_iter().reduce(Expression::or)
    }

    pub fn traverse(base: Expression, method: PathMethod) -> Self {
        Expression::Traverse {
            base: Box::new(base),
            method,
        }
    }

    /// True when evaluation does not depend on the row being evaluated
    pub fn is_row_independent(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::Parameter(_) | Expression::Variable(_) => true,
            Expression::Field(_) => false,
            Expression::Property { base, .. } => base.is_row_independent(),
            Expression::Binary { left, right, .. } => left.is_row_independent() && right.is_row_independent(),
            Expression::Unary { expr, .. } => expr.is_row_independent(),
            Expression::Function { args, .. } | Expression::List(args) => {
                args.iter().all(Expression::is_row_independent)
            }
            Expression::Traverse { base, .. } => base.is_row_independent(),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(PropertyValue::String(s)) => write!(f, "'{}'", s),
            Expression::Literal(v) => write!(f, "{}", v),
            Expression::Field(name) => write!(f, "{}", name),
            Expression::Variable(name) => write!(f, "{}", name),
            Expression::Parameter(name) => write!(f, ":{}", name),
            Expression::Property { base, name } => write!(f, "{}.{}", base, name),
            Expression::Binary { left, op, right } => match op {
                BinaryOp::And | BinaryOp::Or => write!(f, "({} {} {})", left, op.symbol(), right),
                _ => write!(f, "{} {} {}", left, op.symbol(), right),
            },
            Expression::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT ({})", expr),
                UnaryOp::Minus => write!(f, "-{}", expr),
                UnaryOp::IsNull => write!(f, "{} IS NULL", expr),
                UnaryOp::IsNotNull => write!(f, "{} IS NOT NULL", expr),
            },
            Expression::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expression::Traverse { base, method } => write!(f, "{}.{}", base, method),
        }
    }
}

/// Relation hop kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Traversal {
    /// Vertex to adjacent vertices
    Out,
    In,
    Both,
    /// Vertex to attached edges
    OutE,
    InE,
    BothE,
    /// Edge to its endpoint vertices
    OutV,
    InV,
    BothV,
}

/// A relation hop with an optional edge class restriction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathMethod {
    pub traversal: Traversal,
    pub class: Option<String>,
}

impl PathMethod {
    pub fn new(traversal: Traversal, class: Option<&str>) -> Self {
        PathMethod {
            traversal,
            class: class.map(str::to_string),
        }
    }

    pub fn out(class: &str) -> Self {
        PathMethod::new(Traversal::Out, Some(class))
    }

    pub fn incoming(class: &str) -> Self {
        PathMethod::new(Traversal::In, Some(class))
    }

    pub fn both(class: &str) -> Self {
        PathMethod::new(Traversal::Both, Some(class))
    }

    /// The hop walking the same relation from the other end
    pub fn reverse(&self) -> PathMethod {
        let traversal = match self.traversal {
            Traversal::Out => Traversal::In,
            Traversal::In => Traversal::Out,
            Traversal::Both => Traversal::Both,
            Traversal::OutE => Traversal::OutV,
            Traversal::InE => Traversal::InV,
            Traversal::BothE => Traversal::BothV,
            Traversal::OutV => Traversal::OutE,
            Traversal::InV => Traversal::InE,
            Traversal::BothV => Traversal::BothE,
        };
        PathMethod {
            traversal,
            class: self.class.clone(),
        }
    }

    fn name(&self) -> &'static str {
        match self.traversal {
            Traversal::Out => "out",
            Traversal::In => "in",
            Traversal::Both => "both",
            Traversal::OutE => "outE",
            Traversal::InE => "inE",
            Traversal::BothE => "bothE",
            Traversal::OutV => "outV",
            Traversal::InV => "inV",
            Traversal::BothV => "bothV",
        }
    }
}

impl fmt::Display for PathMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.class {
            Some(class) => write!(f, "{}('{}')", self.name(), class),
            None => write!(f, "{}()", self.name()),
        }
    }
}

/// Constraints on one MATCH alias: `{class: Person, as: p, where: (...)}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchFilter {
    pub alias: Option<String>,
    pub class: Option<String>,
    pub rid: Option<RecordId>,
    pub where_clause: Option<Expression>,
    pub optional: bool,
    /// Keep expanding while this holds (evaluated with `$depth` bound)
    pub while_condition: Option<Expression>,
    pub max_depth: Option<usize>,
    /// Expose the traversal depth under this alias
    pub depth_alias: Option<String>,
    /// Expose the traversed path under this alias
    pub path_alias: Option<String>,
}

impl MatchFilter {
    pub fn alias(alias: &str) -> Self {
        MatchFilter {
            alias: Some(alias.to_string()),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        MatchFilter::default()
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn rid(mut self, rid: RecordId) -> Self {
        self.rid = Some(rid);
        self
    }

    pub fn filter(mut self, condition: Expression) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn while_condition(mut self, condition: Expression) -> Self {
        self.while_condition = Some(condition);
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn depth_alias(mut self, alias: &str) -> Self {
        self.depth_alias = Some(alias.to_string());
        self
    }

    pub fn path_alias(mut self, alias: &str) -> Self {
        self.path_alias = Some(alias.to_string());
        self
    }

    /// True for recursive (WHILE / maxDepth) hops
    pub fn is_recursive(&self) -> bool {
        self.while_condition.is_some() || self.max_depth.is_some()
    }
}

/// How a hop reaches its destination
#[derive(Debug, Clone, PartialEq)]
pub enum PathItem {
    /// Walk a stored relation
    Method(PathMethod),
    /// Evaluate an expression with `$current` bound to the source
    Field(Expression),
}

impl fmt::Display for PathItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathItem::Method(method) => write!(f, ".{}", method),
            PathItem::Field(expr) => write!(f, ".({})", expr),
        }
    }
}

/// One hop of a MATCH expression and the filter on its destination
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPathItem {
    pub item: PathItem,
    pub filter: MatchFilter,
}

impl MatchPathItem {
    pub fn method(method: PathMethod, filter: MatchFilter) -> Self {
        MatchPathItem {
            item: PathItem::Method(method),
            filter,
        }
    }

    pub fn field(expr: Expression, filter: MatchFilter) -> Self {
        MatchPathItem {
            item: PathItem::Field(expr),
            filter,
        }
    }
}

/// A chain `{origin}.hop{..}.hop{..}`
#[derive(Debug, Clone, PartialEq)]
pub struct MatchExpression {
    pub origin: MatchFilter,
    pub items: Vec<MatchPathItem>,
}

impl MatchExpression {
    pub fn new(origin: MatchFilter) -> Self {
        MatchExpression {
            origin,
            items: Vec::new(),
        }
    }

    pub fn then(mut self, method: PathMethod, filter: MatchFilter) -> Self {
        self.items.push(MatchPathItem::method(method, filter));
        self
    }

    pub fn then_field(mut self, expr: Expression, filter: MatchFilter) -> Self {
        self.items.push(MatchPathItem::field(expr, filter));
        self
    }
}

/// What a MATCH statement returns
#[derive(Debug, Clone, PartialEq)]
pub enum MatchReturn {
    /// `$patterns`: user aliases only
    Patterns,
    /// `$paths`: every alias, including generated ones
    Paths,
    /// `$elements`: one row per matched user-alias record
    Elements,
    /// `$pathElements`: one row per matched record of any alias
    PathElements,
    Items(Vec<ProjectionItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchStatement {
    pub expressions: Vec<MatchExpression>,
    pub returns: MatchReturn,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// `expression AS alias`
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expression: Expression,
    pub alias: String,
}

impl ProjectionItem {
    pub fn new(expression: Expression, alias: &str) -> Self {
        ProjectionItem {
            expression,
            alias: alias.to_string(),
        }
    }
}

/// Order by item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expression: Expression,
    pub ascending: bool,
}

/// Source of a SELECT
#[derive(Debug, Clone, PartialEq)]
pub enum SelectTarget {
    Class(String),
    Rids(Vec<RecordId>),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub target: SelectTarget,
    /// LET clauses in order; row-independent leading ones are evaluated once
    pub let_clauses: Vec<(String, Expression)>,
    pub where_clause: Option<Expression>,
    /// Empty means every property
    pub projection: Vec<ProjectionItem>,
    pub distinct: bool,
    pub unwind: Option<String>,
    pub order_by: Vec<OrderByItem>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl SelectStatement {
    pub fn from_class(class: &str) -> Self {
        SelectStatement {
            target: SelectTarget::Class(class.to_string()),
            let_clauses: Vec::new(),
            where_clause: None,
            projection: Vec::new(),
            distinct: false,
            unwind: None,
            order_by: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    pub fn filter(mut self, condition: Expression) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order_by.push(OrderByItem {
            expression: Expression::field(field),
            ascending,
        });
        self
    }
}

/// Compound assignment operators of `SET`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Subtract,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItem {
    pub field: String,
    pub op: AssignOp,
    pub value: Expression,
}

impl UpdateItem {
    pub fn set(field: &str, value: Expression) -> Self {
        UpdateItem {
            field: field.to_string(),
            op: AssignOp::Assign,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOperation {
    Set(Vec<UpdateItem>),
    Remove(Vec<String>),
    /// Merge a map into the record
    Merge(Expression),
    /// Replace the record content with a map
    Content(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub class: String,
    pub where_clause: Option<Expression>,
    pub operations: Vec<UpdateOperation>,
    /// `RETURN BEFORE`
    pub return_before: bool,
    pub batch_size: Option<Expression>,
    pub limit: Option<usize>,
}

/// Record kind a DELETE insists on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    Any,
    Vertex,
    Edge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub class: String,
    pub kind: DeleteKind,
    pub where_clause: Option<Expression>,
    pub batch_size: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub class: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expression>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_display() {
        let expr = Expression::and(
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("name", BinaryOp::StartsWith, "Al"),
        );
        assert_eq!(format!("{}", expr), "(a = 1 AND name STARTS WITH 'Al')");
    }

    #[test]
    fn test_row_independence() {
        assert!(Expression::literal(1i64).is_row_independent());
        assert!(Expression::parameter("p").is_row_independent());
        assert!(!Expression::field("a").is_row_independent());
        let mixed = Expression::binary(Expression::field("a"), BinaryOp::Add, Expression::literal(1i64));
        assert!(!mixed.is_row_independent());
    }

    #[test]
    fn test_path_method_reverse() {
        assert_eq!(PathMethod::out("Knows").reverse(), PathMethod::incoming("Knows"));
        let out_e = PathMethod::new(Traversal::OutE, Some("Knows"));
        assert_eq!(out_e.reverse().traversal, Traversal::OutV);
        assert_eq!(out_e.reverse().reverse(), out_e);
        assert_eq!(format!("{}", PathMethod::new(Traversal::Both, None)), "both()");
    }

    #[test]
    fn test_operator_flip() {
        assert_eq!(BinaryOp::Lt.flip(), Some(BinaryOp::Gt));
        assert_eq!(BinaryOp::Ge.flip(), Some(BinaryOp::Le));
        assert_eq!(BinaryOp::Contains.flip(), None);
        assert!(BinaryOp::Le.is_range());
        assert!(!BinaryOp::Eq.is_range());
    }

    #[test]
    fn test_fold_conditions() {
        assert!(Expression::all(Vec::new()).is_none());
        let folded = Expression::any(vec![Expression::field("a"), Expression::field("b")]).unwrap();
        assert_eq!(format!("{}", folded), "(a OR b)");
    }
}
