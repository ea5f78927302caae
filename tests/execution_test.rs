use std::sync::Arc;
use tessera::graph::{DataSession, MemoryDatabase};
use tessera::index::{IndexDefinition, IndexKind};
use tessera::query::ast::{BinaryOp, InsertStatement, UpdateItem, UpdateOperation, UpdateStatement};
use tessera::query::{Expression, SelectPlanner, SelectStatement, Value};
use tessera::{EngineConfig, QueryEngine, Statement};

/// 3 x 7 grid of `Item {a, b, c = a * 10 + b}` indexed on `(a, b)`
fn items() -> Arc<MemoryDatabase> {
    let db = MemoryDatabase::new();
    db.create_class("Item", None).unwrap();
    for a in 0..3i64 {
        for b in 0..7i64 {
            db.insert_document("Item", [("a", a), ("b", b), ("c", a * 10 + b)]).unwrap();
        }
    }
    db.create_index(IndexDefinition::new("Item.a_b", "Item", &["a", "b"], IndexKind::NotUnique))
        .unwrap();
    Arc::new(db)
}

fn bump_c(batch_size: Option<i64>) -> UpdateStatement {
    UpdateStatement {
        class: "Item".to_string(),
        where_clause: Some(Expression::compare("a", BinaryOp::Eq, 1i64)),
        operations: vec![UpdateOperation::Set(vec![UpdateItem::set(
            "c",
            Expression::binary(Expression::field("c"), BinaryOp::Add, Expression::literal(100i64)),
        )])],
        return_before: false,
        batch_size: batch_size.map(Expression::literal),
        limit: None,
    }
}

#[test]
fn test_identical_or_branches_share_one_index_scan() {
    let engine = QueryEngine::new(items());
    let mut ctx = engine.context();
    let branch = |extra: Option<Expression>| {
        let mut conditions = vec![
            Expression::compare("a", BinaryOp::Eq, 1i64),
            Expression::compare("b", BinaryOp::Ge, 2i64),
            Expression::compare("b", BinaryOp::Lt, 5i64),
        ];
        conditions.extend(extra);
        Expression::all(conditions).unwrap()
    };
    let statement = Statement::Select(SelectStatement::from_class("Item").filter(Expression::or(
        branch(None),
        branch(Some(Expression::compare("c", BinaryOp::Eq, 13i64))),
    )));
    let text = "SELECT FROM Item WHERE (a = 1 AND b >= 2 AND b < 5) OR (a = 1 AND b >= 2 AND b < 5 AND c = 13)";

    let plan = engine.prepare(text, &statement, &ctx).unwrap();
    let printed = plan.pretty_print(0, 2);
    assert_eq!(printed.matches("FETCH FROM INDEX").count(), 1);
    assert!(!printed.contains("FILTER"));
    assert!(!printed.contains("DISTINCT"));

    let rows = engine.execute(text, &statement, &mut ctx).unwrap();
    let cs: Vec<Value> = rows.iter().map(|r| r.property("c")).collect();
    assert_eq!(cs, vec![Value::from(12i64), Value::from(13i64), Value::from(14i64)]);
}

#[test]
fn test_batch_commit_cadence() {
    let db = items();
    let engine = QueryEngine::new(db.clone());
    let mut ctx = engine.context();
    db.begin().unwrap();
    let rows = engine
        .execute("UPDATE Item SET c += 100 WHERE a = 1 BATCH 3", &Statement::Update(bump_c(Some(3))), &mut ctx)
        .unwrap();
    assert_eq!(rows.len(), 7);
    // Committed after the 3rd and 6th saves; the 7th is still pending
    assert_eq!(db.commit_count(), 2);
    assert!(db.is_tx_active());
    assert_eq!(db.tx_entry_count(), 1);
    db.commit().unwrap();
    assert_eq!(db.commit_count(), 3);
}

#[test]
fn test_invalid_batch_size_is_rejected_at_planning() {
    let engine = QueryEngine::new(items());
    let ctx = engine.context();
    let result = engine.plan(&Statement::Update(bump_c(Some(0))), &ctx);
    assert!(matches!(result, Err(tessera::ExecutionError::InvalidConfiguration(_))));
}

#[test]
fn test_update_plan_buffers_until_reset() {
    let db = items();
    let engine = QueryEngine::new(db.clone());
    let mut ctx = engine.context();
    let mut plan = engine.plan(&Statement::Update(bump_c(None)), &ctx).unwrap();
    assert!(plan.can_be_cached());

    let first = plan.execute_to_vec(&mut ctx).unwrap();
    let replay = plan.execute_to_vec(&mut ctx).unwrap();
    assert_eq!(first, replay);
    assert_eq!(first[0].property("c"), Value::from(110i64));

    let mut copy = plan.copy();
    assert_eq!(copy.pretty_print(0, 2), plan.pretty_print(0, 2));
    let second = copy.execute_to_vec(&mut ctx).unwrap();
    assert_eq!(second[0].property("c"), Value::from(210i64));
    // The original keeps its own buffer
    assert_eq!(plan.execute_to_vec(&mut ctx).unwrap(), first);
}

#[test]
fn test_plan_cache_follows_configuration() {
    let config = EngineConfig::from_yaml_str("plan_cache_size: 0\nmax_retries: 2\n").unwrap();
    let engine = QueryEngine::with_config(items(), config);
    let mut ctx = engine.context();
    let select = Statement::Select(SelectStatement::from_class("Item"));
    assert_eq!(engine.execute("SELECT FROM Item", &select, &mut ctx).unwrap().len(), 21);
    assert!(!engine.cache().is_enabled());
    assert!(engine.cache().is_empty());

    let engine = QueryEngine::new(items());
    let mut ctx = engine.context();
    engine.execute("SELECT FROM Item", &select, &mut ctx).unwrap();
    engine
        .execute("UPDATE Item SET c += 100 WHERE a = 1 BATCH 3", &Statement::Update(bump_c(Some(3))), &mut ctx)
        .unwrap();
    assert_eq!(engine.cache().len(), 1);
    let rows = engine
        .execute("UPDATE Item SET c += 100 WHERE a = 1", &Statement::Update(bump_c(None)), &mut ctx)
        .unwrap();
    assert_eq!(engine.cache().len(), 2);
    let cached = engine
        .execute("UPDATE Item SET c += 100 WHERE a = 1", &Statement::Update(bump_c(None)), &mut ctx)
        .unwrap();
    assert_eq!(cached[0].property("c"), Value::from(rows[0].property("c").as_integer().unwrap() + 100));
}

#[test]
fn test_for_each_runs_body_per_item() {
    let db = items();
    db.create_class("Note", None).unwrap();
    let mut ctx = QueryEngine::new(db.clone()).context();
    let planner = SelectPlanner::new();
    let insert = InsertStatement {
        class: "Note".to_string(),
        columns: vec!["text".to_string()],
        rows: vec![vec![Expression::variable("$word")]],
    };
    let body = planner.plan_insert(&insert, &ctx).unwrap().pipeline().clone();
    let source = Expression::List(vec![Expression::literal("alpha"), Expression::literal("beta")]);
    let mut plan = planner.plan_for_each("$word", source, body, &ctx);
    let rows = plan.execute_to_vec(&mut ctx).unwrap();
    let texts: Vec<Value> = rows.iter().map(|r| r.property("text")).collect();
    assert_eq!(texts, vec![Value::from("alpha"), Value::from("beta")]);
    assert_eq!(db.count_class("Note").unwrap(), 2);
}

#[test]
fn test_retry_exhaustion_rolls_back() {
    let db = items();
    let engine = QueryEngine::new(db.clone());
    db.inject_conflicts(10).unwrap();
    let mut ctx = engine.context();
    let result = engine.execute_with_retry(&Statement::Update(bump_c(None)), &mut ctx);
    assert!(matches!(result, Err(ref e) if e.is_retryable()));
    assert!(!db.is_tx_active());
    assert_eq!(db.commit_count(), 0);
}
