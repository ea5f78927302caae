use anyhow::Context;
use std::sync::Arc;
use tessera::graph::MemoryDatabase;
use tessera::index::{IndexDefinition, IndexKind};
use tessera::query::ast::{
    BinaryOp, Expression, MatchExpression, MatchFilter, MatchReturn, MatchStatement, PathMethod, ProjectionItem,
    SelectStatement, UpdateItem, UpdateOperation, UpdateStatement,
};
use tessera::query::executor::plan::DEFAULT_INDENT;
use tessera::{EngineConfig, PropertyValue, QueryEngine, Statement};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("Tessera query engine v{}", tessera::version());
    println!("==========================================");

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(&path).with_context(|| format!("loading config from {}", path))?,
        None => EngineConfig::default(),
    };

    let db = Arc::new(MemoryDatabase::new());
    load_demo_graph(&db)?;
    let engine = QueryEngine::with_config(db.clone(), config);

    demo_select(&engine)?;
    demo_match(&engine)?;
    demo_update(&engine)?;

    println!("\nPlans cached: {}", engine.cache().len());
    Ok(())
}

fn load_demo_graph(db: &MemoryDatabase) -> anyhow::Result<()> {
    println!("\n=== Demo graph ===");
    db.create_vertex_class("Person")?;
    db.create_edge_class("Knows")?;
    db.create_index(IndexDefinition::new("Person.city_age", "Person", &["city", "age"], IndexKind::NotUnique))?;

    let people = [("Alice", 30i64, "New York"), ("Bob", 25, "San Francisco"), ("Charlie", 35, "New York")];
    let mut rids = Vec::new();
    for (name, age, city) in people {
        let properties: [(&str, PropertyValue); 3] = [("name", name.into()), ("age", age.into()), ("city", city.into())];
        let rid = db.insert_vertex("Person", properties)?;
        println!("✓ Created Person: {} ({}, {}) as {}", name, age, city, rid);
        rids.push(rid);
    }
    db.insert_edge("Knows", rids[0], rids[1], [("since", 2020i64)])?;
    db.insert_edge("Knows", rids[1], rids[2], [("since", 2019i64)])?;
    println!("✓ Alice -[Knows]-> Bob -[Knows]-> Charlie");
    Ok(())
}

fn demo_select(engine: &QueryEngine) -> anyhow::Result<()> {
    println!("\n=== SELECT with an index access path ===");
    let text = "SELECT FROM Person WHERE city = 'New York' AND age >= 30";
    let select = SelectStatement::from_class("Person").filter(Expression::and(
        Expression::compare("city", BinaryOp::Eq, "New York"),
        Expression::compare("age", BinaryOp::Ge, 30i64),
    ));
    let statement = Statement::Select(select);
    let mut ctx = engine.context();
    let plan = engine.prepare(text, &statement, &ctx)?;
    println!("{}\n{}", text, plan.pretty_print(0, DEFAULT_INDENT));
    for row in engine.execute(text, &statement, &mut ctx)? {
        println!("  → {}", row);
    }
    Ok(())
}

fn demo_match(engine: &QueryEngine) -> anyhow::Result<()> {
    println!("\n=== MATCH friends of friends ===");
    let text = "MATCH {class: Person, as: a}.out('Knows'){as: b}.out('Knows'){as: c} RETURN a.name, c.name";
    let name = |alias: &str| Expression::Property {
        base: Box::new(Expression::field(alias)),
        name: "name".to_string(),
    };
    let statement = Statement::Match(MatchStatement {
        expressions: vec![MatchExpression::new(MatchFilter::alias("a").class("Person"))
            .then(PathMethod::out("Knows"), MatchFilter::alias("b"))
            .then(PathMethod::out("Knows"), MatchFilter::alias("c"))],
        returns: MatchReturn::Items(vec![ProjectionItem::new(name("a"), "a"), ProjectionItem::new(name("c"), "c")]),
        skip: None,
        limit: None,
    });
    let mut ctx = engine.context();
    let plan = engine.prepare(text, &statement, &ctx)?;
    println!("{}", plan.pretty_print(0, DEFAULT_INDENT));
    for row in engine.execute(text, &statement, &mut ctx)? {
        println!("  → {}", row);
    }
    Ok(())
}

fn demo_update(engine: &QueryEngine) -> anyhow::Result<()> {
    println!("\n=== UPDATE ... RETURN BEFORE ===");
    let statement = Statement::Update(UpdateStatement {
        class: "Person".to_string(),
        where_clause: Some(Expression::compare("name", BinaryOp::Eq, "Bob")),
        operations: vec![UpdateOperation::Set(vec![UpdateItem::set(
            "age",
            Expression::binary(Expression::field("age"), BinaryOp::Add, Expression::literal(1i64)),
        )])],
        return_before: true,
        batch_size: None,
        limit: None,
    });
    let mut ctx = engine.context();
    for row in engine.execute_with_retry(&statement, &mut ctx)? {
        println!("  → before: {}", row);
    }
    Ok(())
}
