use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera::graph::{DataSession, MemoryDatabase};
use tessera::index::{IndexDefinition, IndexKind};
use tessera::query::ast::{
    BinaryOp, InsertStatement, MatchExpression, MatchFilter, MatchReturn, MatchStatement, PathMethod, UpdateItem,
    UpdateOperation, UpdateStatement,
};
use tessera::query::executor::{stream, ExecutionStream, StreamExt};
use tessera::query::{CommandContext, ExecutionError, Expression, MatchPlanner, SelectPlanner, SelectStatement};
use tessera::{QueryEngine, Statement};

fn items() -> Arc<MemoryDatabase> {
    let db = MemoryDatabase::new();
    db.create_class("Item", None).unwrap();
    for a in 0..4i64 {
        for b in 0..5i64 {
            db.insert_document("Item", [("a", a), ("b", b)]).unwrap();
        }
    }
    db.create_index(IndexDefinition::new("Item.a", "Item", &["a"], IndexKind::NotUnique))
        .unwrap();
    Arc::new(db)
}

fn past_deadline(ctx: &mut CommandContext) {
    ctx.set_deadline(Some(Instant::now() - Duration::from_millis(1)));
}

#[test]
fn test_class_scan_stops_midway_and_closes() {
    let mut ctx = CommandContext::new(items());
    let plan = SelectPlanner::new()
        .plan_select(&SelectStatement::from_class("Item"), &ctx)
        .unwrap();
    let closed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&closed);
    let mut rows = plan
        .start(&mut ctx)
        .unwrap()
        .on_close(move |_| flag.store(true, Ordering::Relaxed));
    for _ in 0..3 {
        rows.next(&mut ctx).unwrap();
    }

    ctx.interrupt_handle().store(true, Ordering::Relaxed);
    let result = stream::drain(rows, &mut ctx);
    assert!(matches!(result, Err(ExecutionError::Interrupted)));
    assert!(closed.load(Ordering::Relaxed));
}

#[test]
fn test_index_fetch_honors_deadline() {
    let mut ctx = CommandContext::new(items());
    let statement = SelectStatement::from_class("Item").filter(Expression::compare("a", BinaryOp::Eq, 2i64));
    let plan = SelectPlanner::new().plan_select(&statement, &ctx).unwrap();
    assert!(plan.pretty_print(0, 2).contains("FETCH FROM INDEX"));
    assert_eq!(plan.execute_to_vec(&mut ctx).unwrap().len(), 5);

    past_deadline(&mut ctx);
    assert!(matches!(plan.execute_to_vec(&mut ctx), Err(ExecutionError::Timeout(_))));
}

#[test]
fn test_while_traversal_stops_when_interrupted() {
    let db = MemoryDatabase::new();
    db.create_vertex_class("Stop").unwrap();
    db.create_edge_class("Next").unwrap();
    let stops: Vec<_> = (0..30)
        .map(|i| db.insert_vertex("Stop", [("name", format!("s{}", i))]).unwrap())
        .collect();
    for (i, from) in stops.iter().enumerate() {
        db.insert_edge("Next", *from, stops[(i + 1) % stops.len()], [("w", 1i64)])
            .unwrap();
    }
    let mut ctx = CommandContext::new(Arc::new(db));
    let statement = MatchStatement {
        expressions: vec![MatchExpression::new(MatchFilter::alias("from").class("Stop")).then(
            PathMethod::out("Next"),
            MatchFilter::alias("to").while_condition(Expression::literal(true)),
        )],
        returns: MatchReturn::Patterns,
        skip: None,
        limit: None,
    };
    let plan = MatchPlanner::new(&statement).plan(&ctx).unwrap();
    let mut rows = plan.start(&mut ctx).unwrap();
    for _ in 0..10 {
        rows.next(&mut ctx).unwrap();
    }

    ctx.interrupt_handle().store(true, Ordering::Relaxed);
    assert!(matches!(stream::drain(rows, &mut ctx), Err(ExecutionError::Interrupted)));
}

#[test]
fn test_for_each_honors_deadline() {
    let db = items();
    db.create_class("Note", None).unwrap();
    let mut ctx = CommandContext::new(db.clone());
    let planner = SelectPlanner::new();
    let insert = InsertStatement {
        class: "Note".to_string(),
        columns: vec!["text".to_string()],
        rows: vec![vec![Expression::variable("$word")]],
    };
    let body = planner.plan_insert(&insert, &ctx).unwrap().pipeline().clone();
    let words = Expression::List(vec![Expression::literal("alpha"), Expression::literal("beta")]);
    let mut plan = planner.plan_for_each("$word", words, body, &ctx);

    past_deadline(&mut ctx);
    assert!(matches!(plan.execute_to_vec(&mut ctx), Err(ExecutionError::Timeout(_))));
    assert_eq!(db.count_class("Note").unwrap(), 0);
}

#[test]
fn test_interrupted_retry_does_not_start_a_transaction() {
    let db = items();
    let engine = QueryEngine::new(db.clone());
    let mut ctx = engine.context();
    let update = Statement::Update(UpdateStatement {
        class: "Item".to_string(),
        where_clause: Some(Expression::compare("a", BinaryOp::Eq, 1i64)),
        operations: vec![UpdateOperation::Set(vec![UpdateItem::set("b", Expression::literal(0i64))])],
        return_before: false,
        batch_size: None,
        limit: None,
    });
    ctx.interrupt_handle().store(true, Ordering::Relaxed);
    let result = engine.execute_with_retry(&update, &mut ctx);
    assert!(matches!(result, Err(ExecutionError::Interrupted)));
    assert!(!db.is_tx_active());
    assert_eq!(db.commit_count(), 0);
}
