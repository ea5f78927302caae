//! Expression evaluation against rows and the command context
//!
//! Evaluation is synchronous and side-effect free; the only state it reads
//! besides the row is the context's variables, parameters and data session.

use super::ast::{BinaryOp, Expression, PathMethod, Traversal, UnaryOp};
use super::executor::context::CommandContext;
use super::executor::record::{Row, Value};
use super::executor::{ExecutionError, ExecutionResult};
use crate::graph::{Direction, PropertyValue, RecordId};
use regex::Regex;
use std::cmp::Ordering;

impl Expression {
    /// Evaluate to a value
    pub fn evaluate(&self, row: &Row, ctx: &CommandContext) -> ExecutionResult<Value> {
        match self {
            Expression::Literal(lit) => Ok(Value::from_property(lit)),
            Expression::Field(name) => Ok(field_of_row(row, name)),
            Expression::Variable(name) => Ok(ctx.variable(name).cloned().unwrap_or(Value::Null)),
            Expression::Parameter(name) => ctx
                .parameter(name)
                .map(Value::from_property)
                .ok_or_else(|| ExecutionError::VariableNotFound(format!(":{}", name))),
            Expression::Property { base, name } => {
                let base = base.evaluate(row, ctx)?;
                property_of(&base, name, ctx)
            }
            Expression::Binary { left, op, right } => match op {
                BinaryOp::And => {
                    if !left.matches(row, ctx)? {
                        return Ok(Value::from(false));
                    }
                    Ok(Value::from(right.matches(row, ctx)?))
                }
                BinaryOp::Or => {
                    if left.matches(row, ctx)? {
                        return Ok(Value::from(true));
                    }
                    Ok(Value::from(right.matches(row, ctx)?))
                }
                _ => {
                    let left = left.evaluate(row, ctx)?;
                    let right = right.evaluate(row, ctx)?;
                    evaluate_binary_op(*op, &left, &right)
                }
            },
            Expression::Unary { op, expr } => {
                let value = expr.evaluate(row, ctx)?;
                match op {
                    UnaryOp::Not => Ok(Value::from(!is_truthy(&value))),
                    UnaryOp::IsNull => Ok(Value::from(value.is_null())),
                    UnaryOp::IsNotNull => Ok(Value::from(!value.is_null())),
                    UnaryOp::Minus => match value.to_property() {
                        PropertyValue::Integer(i) => Ok(Value::from(-i)),
                        PropertyValue::Float(f) => Ok(Value::Property(PropertyValue::Float(-f))),
                        PropertyValue::Null => Ok(Value::Null),
                        other => Err(ExecutionError::TypeError(format!(
                            "Cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expression::Function { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(row, ctx))
                    .collect::<ExecutionResult<Vec<_>>>()?;
                evaluate_function(name, args)
            }
            Expression::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.evaluate(row, ctx))
                    .collect::<ExecutionResult<Vec<_>>>()?,
            )),
            Expression::Traverse { base, method } => {
                let base = base.evaluate(row, ctx)?;
                traverse(&base, method, ctx)
            }
        }
    }

    /// Evaluate as a predicate; anything but `true` fails it
    pub fn matches(&self, row: &Row, ctx: &CommandContext) -> ExecutionResult<bool> {
        Ok(is_truthy(&self.evaluate(row, ctx)?))
    }
}

pub fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Property(PropertyValue::Boolean(true)))
}

/// Total order used by ORDER BY; nulls sort first
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    left.to_property().cmp(&right.to_property())
}

fn field_of_row(row: &Row, name: &str) -> Value {
    match name {
        "@rid" => row.rid().map(Value::Record).unwrap_or(Value::Null),
        "@class" => row.class().map(Value::from).unwrap_or(Value::Null),
        "@this" => Value::from(row.clone()),
        _ => row.property(name),
    }
}

/// `base.name` for every shape a value can take
fn property_of(base: &Value, name: &str, ctx: &CommandContext) -> ExecutionResult<Value> {
    match base {
        Value::Row(row) => Ok(field_of_row(row, name)),
        Value::Record(rid) => match ctx.session().load(*rid)? {
            Some(entity) => Ok(field_of_row(&Row::from_entity(&entity), name)),
            None => Ok(Value::Null),
        },
        Value::Property(PropertyValue::Map(map)) => {
            Ok(map.get(name).map(Value::from_property).unwrap_or(Value::Null))
        }
        Value::Property(PropertyValue::Link(rid)) => property_of(&Value::Record(*rid), name, ctx),
        Value::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| property_of(item, name, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?,
        )),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn evaluate_binary_op(op: BinaryOp, left: &Value, right: &Value) -> ExecutionResult<Value> {
    let result = match op {
        BinaryOp::Eq => values_equal(left, right),
        BinaryOp::Ne => !left.is_null() && !right.is_null() && !values_equal(left, right),
        BinaryOp::Lt => compare_ordered(left, right).map_or(false, |o| o == Ordering::Less),
        BinaryOp::Le => compare_ordered(left, right).map_or(false, |o| o != Ordering::Greater),
        BinaryOp::Gt => compare_ordered(left, right).map_or(false, |o| o == Ordering::Greater),
        BinaryOp::Ge => compare_ordered(left, right).map_or(false, |o| o != Ordering::Less),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            return arithmetic(op, left, right)
        }
        BinaryOp::StartsWith => match (left.as_property(), right.as_property()) {
            (Some(PropertyValue::String(l)), Some(PropertyValue::String(r))) => l.starts_with(r.as_str()),
            _ => false,
        },
        BinaryOp::EndsWith => match (left.as_property(), right.as_property()) {
            (Some(PropertyValue::String(l)), Some(PropertyValue::String(r))) => l.ends_with(r.as_str()),
            _ => false,
        },
        BinaryOp::Contains => match (left, right.as_property()) {
            (Value::Property(PropertyValue::String(l)), Some(PropertyValue::String(r))) => l.contains(r.as_str()),
            (Value::List(items), _) => items.iter().any(|item| values_equal(item, right)),
            _ => false,
        },
        BinaryOp::In => match right {
            Value::List(items) => items.iter().any(|item| values_equal(left, item)),
            _ => values_equal(left, right),
        },
        BinaryOp::ContainsKey => match (left.as_property(), right.as_property()) {
            (Some(PropertyValue::Map(map)), Some(PropertyValue::String(key))) => map.contains_key(key),
            _ => false,
        },
        BinaryOp::ContainsValue => match left.as_property() {
            Some(PropertyValue::Map(map)) => {
                let wanted = right.to_property();
                map.values().any(|v| *v == wanted)
            }
            _ => false,
        },
        BinaryOp::RegexMatch => match (left.as_property(), right.as_property()) {
            (Some(PropertyValue::String(text)), Some(PropertyValue::String(pattern))) => {
                let regex = Regex::new(pattern)
                    .map_err(|e| ExecutionError::TypeError(format!("Invalid regex '{}': {}", pattern, e)))?;
                regex.is_match(text)
            }
            _ => false,
        },
        BinaryOp::And | BinaryOp::Or => {
            let l = is_truthy(left);
            let r = is_truthy(right);
            if op == BinaryOp::And {
                l && r
            } else {
                l || r
            }
        }
    };
    Ok(Value::from(result))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    match (left.as_rid(), right.as_rid()) {
        (Some(a), Some(b)) => a == b,
        _ => left.to_property() == right.to_property(),
    }
}

/// Ordering of two comparable values; `None` for nulls and mismatched types
fn compare_ordered(left: &Value, right: &Value) -> Option<Ordering> {
    let (l, r) = (left.to_property(), right.to_property());
    let comparable = matches!(
        (&l, &r),
        (PropertyValue::Integer(_) | PropertyValue::Float(_), PropertyValue::Integer(_) | PropertyValue::Float(_))
            | (PropertyValue::String(_), PropertyValue::String(_))
            | (PropertyValue::Boolean(_), PropertyValue::Boolean(_))
            | (PropertyValue::Link(_), PropertyValue::Link(_))
    );
    if comparable {
        Some(l.cmp(&r))
    } else {
        None
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> ExecutionResult<Value> {
    use PropertyValue::*;
    let (l, r) = (left.to_property(), right.to_property());
    let result = match (&l, &r) {
        (Null, _) | (_, Null) => Null,
        (String(a), _) if op == BinaryOp::Add => String(format!("{}{}", a, display_plain(&r))),
        (Integer(a), Integer(b)) => match op {
            BinaryOp::Add => Integer(a.wrapping_add(*b)),
            BinaryOp::Sub => Integer(a.wrapping_sub(*b)),
            BinaryOp::Mul => Integer(a.wrapping_mul(*b)),
            BinaryOp::Div | BinaryOp::Mod if *b == 0 => {
                return Err(ExecutionError::RuntimeError("Division by zero".to_string()))
            }
            BinaryOp::Div => Integer(a / b),
            _ => Integer(a % b),
        },
        (Integer(_) | Float(_), Integer(_) | Float(_)) => {
            let (a, b) = (l.as_float().unwrap_or(0.0), r.as_float().unwrap_or(0.0));
            match op {
                BinaryOp::Add => Float(a + b),
                BinaryOp::Sub => Float(a - b),
                BinaryOp::Mul => Float(a * b),
                BinaryOp::Div => Float(a / b),
                _ => Float(a % b),
            }
        }
        _ => {
            return Err(ExecutionError::TypeError(format!(
                "Cannot apply {} to {} and {}",
                op.symbol(),
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(Value::from_property(&result))
}

fn display_plain(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate_function(name: &str, args: Vec<Value>) -> ExecutionResult<Value> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    match name.to_lowercase().as_str() {
        "size" | "count" => {
            let size = match &first {
                Value::List(items) => items.len(),
                Value::Row(row) => row.len(),
                Value::Null | Value::EmptyOptional => 0,
                Value::Property(PropertyValue::String(s)) => s.chars().count(),
                Value::Property(PropertyValue::Map(map)) => map.len(),
                Value::Property(PropertyValue::Null) => 0,
                _ => 1,
            };
            Ok(Value::from(size as i64))
        }
        "coalesce" => Ok(args
            .into_iter()
            .find(|v| !v.is_null() && !v.is_empty_optional())
            .unwrap_or(Value::Null)),
        "lower" | "tolowercase" => match first.to_property() {
            PropertyValue::String(s) => Ok(Value::from(s.to_lowercase().as_str())),
            _ => Ok(Value::Null),
        },
        "upper" | "touppercase" => match first.to_property() {
            PropertyValue::String(s) => Ok(Value::from(s.to_uppercase().as_str())),
            _ => Ok(Value::Null),
        },
        "abs" => match first.to_property() {
            PropertyValue::Integer(i) => Ok(Value::from(i.abs())),
            PropertyValue::Float(f) => Ok(Value::Property(PropertyValue::Float(f.abs()))),
            _ => Ok(Value::Null),
        },
        "keys" => match first.to_property() {
            PropertyValue::Map(map) => Ok(Value::List(map.keys().map(|k| Value::from(k.as_str())).collect())),
            _ => Ok(Value::List(Vec::new())),
        },
        _ => Err(ExecutionError::RuntimeError(format!("Unknown function: {}", name))),
    }
}

/// Records reachable from `base` through one relation hop
pub fn traverse(base: &Value, method: &PathMethod, ctx: &CommandContext) -> ExecutionResult<Value> {
    let sources: Vec<RecordId> = match base {
        Value::List(items) => items.iter().filter_map(Value::as_rid).collect(),
        other => other.as_rid().into_iter().collect(),
    };
    let session = ctx.session();
    let class = method.class.as_deref();
    let mut result = Vec::new();
    for rid in sources {
        let entity = match session.load(rid)? {
            Some(entity) => entity,
            None => continue,
        };
        match method.traversal {
            Traversal::Out | Traversal::In | Traversal::Both => {
                if !entity.is_vertex() {
                    continue;
                }
                let direction = direction_of(method.traversal);
                for edge_rid in session.edges(rid, direction, class)? {
                    if let Some((out, to)) = session.load(edge_rid)?.and_then(|e| e.endpoints()) {
                        let other = match direction {
                            Direction::Out => to,
                            Direction::In => out,
                            Direction::Both if out == rid => to,
                            Direction::Both => out,
                        };
                        result.push(Value::Record(other));
                    }
                }
            }
            Traversal::OutE | Traversal::InE | Traversal::BothE => {
                if !entity.is_vertex() {
                    continue;
                }
                let direction = direction_of(method.traversal);
                result.extend(session.edges(rid, direction, class)?.into_iter().map(Value::Record));
            }
            Traversal::OutV | Traversal::InV | Traversal::BothV => {
                let (out, to) = match entity.endpoints() {
                    Some(endpoints) => endpoints,
                    None => continue,
                };
                if let Some(class) = class {
                    if !session.is_subclass_of(&entity.class, class) {
                        continue;
                    }
                }
                match method.traversal {
                    Traversal::OutV => result.push(Value::Record(out)),
                    Traversal::InV => result.push(Value::Record(to)),
                    _ => {
                        result.push(Value::Record(out));
                        result.push(Value::Record(to));
                    }
                }
            }
        }
    }
    Ok(Value::List(result))
}

fn direction_of(traversal: Traversal) -> Direction {
    match traversal {
        Traversal::Out | Traversal::OutE | Traversal::OutV => Direction::Out,
        Traversal::In | Traversal::InE | Traversal::InV => Direction::In,
        Traversal::Both | Traversal::BothE | Traversal::BothV => Direction::Both,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataSession, MemoryDatabase};
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn fixture() -> (CommandContext, RecordId, RecordId) {
        let db = MemoryDatabase::new();
        db.create_vertex_class("Person").unwrap();
        db.create_edge_class("Knows").unwrap();
        let alice = db.insert_vertex("Person", [("name", PropertyValue::from("Alice")), ("age", 30i64.into())]).unwrap();
        let bob = db.insert_vertex("Person", [("name", PropertyValue::from("Bob")), ("age", 25i64.into())]).unwrap();
        db.insert_edge("Knows", alice, bob, [("since", 2020i64)]).unwrap();
        (CommandContext::new(Arc::new(db)), alice, bob)
    }

    fn row_of(ctx: &CommandContext, rid: RecordId) -> Row {
        Row::from_entity(&ctx.session().load(rid).unwrap().unwrap())
    }

    #[test]
    fn test_comparisons() {
        let (ctx, alice, _) = fixture();
        let row = row_of(&ctx, alice);
        assert!(Expression::compare("age", BinaryOp::Gt, 18i64).matches(&row, &ctx).unwrap());
        assert!(Expression::compare("age", BinaryOp::Le, 30.0).matches(&row, &ctx).unwrap());
        assert!(!Expression::compare("name", BinaryOp::Lt, 5i64).matches(&row, &ctx).unwrap());
        assert!(!Expression::compare("missing", BinaryOp::Eq, PropertyValue::Null).matches(&row, &ctx).unwrap());
        assert!(Expression::compare("name", BinaryOp::RegexMatch, "^Al.*").matches(&row, &ctx).unwrap());
    }

    #[test]
    fn test_logical_short_circuit() {
        let (ctx, alice, _) = fixture();
        let row = row_of(&ctx, alice);
        // Right sides would fail with a missing parameter if evaluated
        let expr = Expression::or(
            Expression::compare("name", BinaryOp::Eq, "Alice"),
            Expression::binary(Expression::field("age"), BinaryOp::Eq, Expression::parameter("nope")),
        );
        assert!(expr.matches(&row, &ctx).unwrap());
        let guarded = Expression::and(
            Expression::compare("name", BinaryOp::Eq, "Bob"),
            Expression::binary(Expression::field("age"), BinaryOp::Eq, Expression::parameter("nope")),
        );
        assert!(!guarded.matches(&row, &ctx).unwrap());
    }

    #[test]
    fn test_parameters_and_variables() {
        let (mut ctx, alice, _) = fixture();
        let row = row_of(&ctx, alice);
        ctx.set_parameter("minAge", 21i64);
        ctx.set_variable("$limit", Value::from(40i64));
        let expr = Expression::and(
            Expression::binary(Expression::field("age"), BinaryOp::Ge, Expression::parameter("minAge")),
            Expression::binary(Expression::field("age"), BinaryOp::Lt, Expression::variable("$limit")),
        );
        assert!(expr.matches(&row, &ctx).unwrap());
        assert!(matches!(
            Expression::parameter("unknown").evaluate(&row, &ctx),
            Err(ExecutionError::VariableNotFound(_))
        ));
    }

    #[test]
    fn test_arithmetic() {
        let (ctx, alice, _) = fixture();
        let row = row_of(&ctx, alice);
        let plus = Expression::binary(Expression::field("age"), BinaryOp::Add, Expression::literal(1i64));
        assert_eq!(plus.evaluate(&row, &ctx).unwrap(), Value::from(31i64));
        let concat = Expression::binary(Expression::field("name"), BinaryOp::Add, Expression::literal(7i64));
        assert_eq!(concat.evaluate(&row, &ctx).unwrap(), Value::from("Alice7"));
        let div = Expression::binary(Expression::field("age"), BinaryOp::Div, Expression::literal(0i64));
        assert!(div.evaluate(&row, &ctx).is_err());
    }

    #[test]
    fn test_map_operators() {
        let (ctx, _, _) = fixture();
        let mut tags = IndexMap::new();
        tags.insert("color".to_string(), PropertyValue::from("red"));
        let row = Row::from_pairs([("tags", Value::Property(PropertyValue::Map(tags)))]);
        assert!(Expression::compare("tags", BinaryOp::ContainsKey, "color").matches(&row, &ctx).unwrap());
        assert!(Expression::compare("tags", BinaryOp::ContainsValue, "red").matches(&row, &ctx).unwrap());
        assert!(!Expression::compare("tags", BinaryOp::ContainsKey, "red").matches(&row, &ctx).unwrap());
    }

    #[test]
    fn test_traversal_and_property_paths() {
        let (ctx, alice, bob) = fixture();
        let row = row_of(&ctx, alice);
        let out = Expression::traverse(Expression::field("@rid"), PathMethod::out("Knows"));
        assert_eq!(out.evaluate(&row, &ctx).unwrap(), Value::List(vec![Value::Record(bob)]));

        let names = Expression::Property {
            base: Box::new(out.clone()),
            name: "name".to_string(),
        };
        assert_eq!(names.evaluate(&row, &ctx).unwrap(), Value::List(vec![Value::from("Bob")]));

        let edges = Expression::traverse(Expression::field("@rid"), PathMethod::new(Traversal::OutE, None));
        let edge_list = edges.evaluate(&row, &ctx).unwrap();
        let back = traverse(&edge_list, &PathMethod::new(Traversal::OutV, Some("Knows")), &ctx).unwrap();
        assert_eq!(back, Value::List(vec![Value::Record(alice)]));

        let count = Expression::Function {
            name: "size".to_string(),
            args: vec![Expression::traverse(Expression::field("@rid"), PathMethod::incoming("Knows"))],
        };
        assert_eq!(count.evaluate(&row, &ctx).unwrap(), Value::from(0i64));
    }
}
