//! Criterion benchmarks for relquery-core.
//!
//! Everything here runs without a Python runtime.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **guards**: Input clamping / truncation.
//! 3. **validation**: STRICT and LAX plan validation.
//! 4. **builder**: Plan compilation and cache-key hashing.
//! 5. **cache**: Region put/get under a bounded entry count.
//! 6. **execution**: Relational, metadata and keyword tiers on a seeded store.
//! 7. **service**: End-to-end query served from the plan and result caches.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/relquery-core/Cargo.toml
//! # Run only the execution group:
//! cargo bench --manifest-path crates/relquery-core/Cargo.toml -- execution
//! ```

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;
use serde_json::json;

use _relquery_core::config::{EngineConfig, ValidationMode};
use _relquery_core::errors::RelQueryResult;
use _relquery_core::models::{
    FilterCondition, FilterOperator, FilterValue, QueryOptions, RelationshipDirection, RelationshipPath,
    RelationshipQueryPlan,
};
use _relquery_core::query::builder::QueryBuilder;
use _relquery_core::query::cache::{plan_cache_key, CacheRegion};
use _relquery_core::query::guards::{clamp_depth, clamp_limit, clamp_threshold, truncate_query};
use _relquery_core::query::keyword::{lexical_score, KeywordSearchExecutor};
use _relquery_core::query::planner::{PlanningOracle, PlanningRequest};
use _relquery_core::query::service::ReliableQueryService;
use _relquery_core::query::traversal::{
    MetadataTraversalExecutor, RelationalTraversalExecutor, TraversalExecutor, TraversalRequest,
};
use _relquery_core::query::validator::QueryValidator;
use _relquery_core::schema::SchemaRegistry;
use _relquery_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};
use _relquery_core::store::{EntityStore, SqliteEntityStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry.register_entity_type("document", "Document").unwrap();
    registry.register_entity_type("user", "User").unwrap();
    registry
        .register_relationship("document", "user", "author", RelationshipDirection::Forward, false)
        .unwrap();
    Arc::new(registry)
}

fn contracts_plan() -> RelationshipQueryPlan {
    let mut plan = RelationshipQueryPlan::new("Find all contracts related to John Smith in Q4 2023", "document");
    plan.candidate_entity_types.insert("user".into());
    plan.relationship_paths.push(RelationshipPath {
        from_entity_type: "document".into(),
        relationship_type: Some("author".into()),
        to_entity_type: "user".into(),
        conditions: vec![FilterCondition::new(
            "fullName",
            FilterOperator::Ilike,
            FilterValue::Text("%John Smith%".into()),
        )],
        ..RelationshipPath::default()
    });
    plan.direct_filters.insert(
        "document".into(),
        vec![
            FilterCondition::new("status", FilterOperator::Equals, FilterValue::Text("ACTIVE".into())),
            FilterCondition::new("title", FilterOperator::Ilike, FilterValue::Text("%Q4 2023%".into())),
        ],
    );
    plan.limit = 25;
    plan
}

/// `n_users` authors, each with `docs_per_user` documents; every fourth
/// document is a Q4 2023 contract.
fn populate_store(store: &SqliteEntityStore, n_users: usize, docs_per_user: usize) {
    for u in 0..n_users {
        let name = if u == 0 { "John Smith".to_string() } else { format!("User {u}") };
        store
            .put_entity("user", &format!("user-{u}"), &json!({"fullName": name}), None, Some(&name))
            .unwrap();
        for d in 0..docs_per_user {
            let id = format!("doc-{u}-{d}");
            let title = if d % 4 == 0 {
                format!("Contract {d} Q4 2023")
            } else {
                format!("Memo {d} Q2 2022")
            };
            let status = if d % 3 == 0 { "DRAFT" } else { "ACTIVE" };
            let attrs = json!({"title": title, "status": status});
            let meta = json!({"title": title, "status": status, "author": {"fullName": name}});
            store
                .put_entity("document", &id, &attrs, Some(&meta), Some(&format!("{title} by {name}")))
                .unwrap();
            store.link("document", &id, "author", "user", &format!("user-{u}")).unwrap();
        }
    }
}

struct StaticOracle(String);

impl PlanningOracle for StaticOracle {
    fn plan(&self, _request: &PlanningRequest<'_>) -> RelQueryResult<String> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// 1. Schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema/init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(conn);
        })
    });
}

// ---------------------------------------------------------------------------
// 2. Guards
// ---------------------------------------------------------------------------

fn bench_guards(c: &mut Criterion) {
    let long_query = "contracts by John Smith ".repeat(200);
    let mut group = c.benchmark_group("guards");
    group.bench_function("clamps", |b| {
        b.iter(|| {
            black_box(clamp_limit(black_box(10_000), 500));
            black_box(clamp_depth(black_box(9)));
            black_box(clamp_threshold(black_box(1.7)));
        })
    });
    group.bench_function("truncate_query", |b| b.iter(|| black_box(truncate_query(black_box(&long_query)))));
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Validation
// ---------------------------------------------------------------------------

fn bench_validation(c: &mut Criterion) {
    let validator = QueryValidator::new(registry(), 3);
    let plan = contracts_plan();
    let mut group = c.benchmark_group("validation");
    for mode in [ValidationMode::Strict, ValidationMode::Lax] {
        group.bench_with_input(BenchmarkId::new("validate", mode.as_str()), &mode, |b, mode| {
            b.iter(|| validator.validate(black_box(&plan), *mode).unwrap())
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 4. Builder
// ---------------------------------------------------------------------------

fn bench_builder(c: &mut Criterion) {
    let builder = QueryBuilder::new(registry());
    let plan = contracts_plan();
    let compiled = builder.build(&plan).unwrap();
    let mut group = c.benchmark_group("builder");
    group.bench_function("build", |b| b.iter(|| builder.build(black_box(&plan)).unwrap()));
    group.bench_function("cache_key", |b| b.iter(|| black_box(compiled.cache_key())));
    group.finish();
}

// ---------------------------------------------------------------------------
// 5. Cache
// ---------------------------------------------------------------------------

fn bench_cache(c: &mut Criterion) {
    let region: CacheRegion<Arc<Vec<String>>> = CacheRegion::new("bench", Duration::from_secs(300), 512);
    let keys: Vec<String> = (0..1024)
        .map(|i| plan_cache_key(&format!("query number {i}"), &[]))
        .collect();
    let value = Arc::new(vec!["doc-1".to_string(), "doc-2".to_string()]);
    let mut group = c.benchmark_group("cache");
    group.bench_function("put_with_eviction", |b| {
        b.iter(|| {
            for key in &keys {
                region.put(key.clone(), Arc::clone(&value));
            }
        })
    });
    group.bench_function("get", |b| {
        b.iter(|| {
            for key in &keys[512..] {
                black_box(region.get(key));
            }
        })
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// 6. Execution tiers
// ---------------------------------------------------------------------------

fn bench_execution(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteEntityStore::open(dir.path().join("bench.db")).unwrap();
    populate_store(&store, 20, 50);
    let store: Arc<dyn EntityStore> = Arc::new(store);

    let plan = contracts_plan();
    let compiled = QueryBuilder::new(registry()).build(&plan).unwrap();
    let request = TraversalRequest {
        plan: &plan,
        query: Some(&compiled),
        limit: plan.limit,
    };
    let relational = RelationalTraversalExecutor::new(Arc::clone(&store));
    let metadata = MetadataTraversalExecutor::new(Arc::clone(&store));
    let keyword = KeywordSearchExecutor::new(Arc::clone(&store));
    let tiers = [
        ("relational", &relational as &dyn TraversalExecutor),
        ("metadata", &metadata as &dyn TraversalExecutor),
        ("keyword", &keyword as &dyn TraversalExecutor),
    ];

    let mut group = c.benchmark_group("execution");
    group.sample_size(20);
    for (name, tier) in tiers {
        group.bench_function(name, |b| b.iter(|| tier.execute(black_box(&request)).unwrap()));
    }
    group.bench_function("lexical_score", |b| {
        b.iter(|| lexical_score(black_box(&plan.original_query), black_box("Contract 4 Q4 2023 by John Smith")))
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// 7. Service
// ---------------------------------------------------------------------------

fn bench_service(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteEntityStore::open(dir.path().join("bench.db")).unwrap();
    populate_store(&store, 10, 20);
    let reply = serde_json::to_string(&contracts_plan()).unwrap();
    let service = ReliableQueryService::new(
        registry(),
        Arc::new(store),
        Arc::new(StaticOracle(reply)),
        EngineConfig::default(),
    );
    let options = QueryOptions::default();
    let query = contracts_plan().original_query;
    service.query(&query, &options).unwrap();

    c.bench_function("service/cached_query", |b| {
        b.iter(|| service.query(black_box(&query), &options).unwrap())
    });
}

criterion_group!(
    benches,
    bench_schema_init,
    bench_guards,
    bench_validation,
    bench_builder,
    bench_cache,
    bench_execution,
    bench_service,
);
criterion_main!(benches);
