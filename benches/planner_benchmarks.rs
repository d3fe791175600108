//! Planner throughput: cold planning versus plan-cache hits.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keystone::config::Config;
use keystone::engine::Engine;
use keystone::index::{IndexDescriptor, IndexKind};
use keystone::kv::MemoryKv;
use keystone::planner::{CompareOp, Predicate, Query};
use keystone::record::{DynRecord, RecordType};
use std::sync::Arc;

fn engine() -> Engine {
    let engine = Engine::new(Config::default(), Arc::new(MemoryKv::new()));
    engine.register_record_type(RecordType::new(
        "user",
        vec!["id", "name", "age"],
        vec!["id"],
    ));
    engine
        .register_index(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ))
        .unwrap();
    for i in 0..1000i64 {
        engine
            .save(
                &DynRecord::new("user")
                    .with("id", i)
                    .with("name", format!("user{i}"))
                    .with("age", i % 60),
            )
            .unwrap();
    }
    engine.analyze("user").unwrap();
    engine
}

fn bench_prepare(c: &mut Criterion) {
    let engine = engine();
    let query = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 30i64));
    // Warm the cache once, then measure hits
    engine.prepare(&query).unwrap();
    c.bench_function("prepare_cached", |b| {
        b.iter(|| engine.prepare(black_box(&query)).unwrap());
    });
}

fn bench_query_end_to_end(c: &mut Criterion) {
    let engine = engine();
    let query = Query::new("user")
        .filter(Predicate::field("age", CompareOp::Eq, 30i64))
        .limit(10);
    c.bench_function("query_point_limit10", |b| {
        b.iter(|| engine.query(black_box(&query)).unwrap());
    });
}

criterion_group!(benches, bench_prepare, bench_query_end_to_end);
criterion_main!(benches);
