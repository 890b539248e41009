//! Query translation and execution benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use entiframe_bench::{customers_session, populate};
use entiframe_core::query::{DocumentSqlGenerator, QuerySqlGenerator, QueryTranslator, RelationalSqlGenerator};
use entiframe_core::{Expression, QueryTrackingBehavior, SqlDialect, StoreKind};
use std::sync::Arc;

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");
    for kind in [StoreKind::Document, StoreKind::Relational] {
        let session = customers_session(kind);
        let translator = QueryTranslator::new(Arc::clone(session.model()));
        let generator: Box<dyn QuerySqlGenerator> = match kind {
            StoreKind::Document => Box::new(DocumentSqlGenerator),
            StoreKind::Relational => Box::new(RelationalSqlGenerator::new(SqlDialect::SqlServer)),
        };
        let query = session.query("Customer").unwrap();
        let query = query
            .clone()
            .filter(query.property("Address.City").equal(Expression::parameter("city")))
            .order_by(query.property("Name"))
            .skip(10)
            .take(20)
            .with_parameter("city", "Oslo");

        group.bench_function(BenchmarkId::new("filter_order_page", format!("{kind:?}")), |b| {
            b.iter(|| {
                let shaper = translator
                    .translate(black_box(&query), false, QueryTrackingBehavior::TrackAll)
                    .unwrap();
                let sql = generator
                    .generate(shaper.query().select(), query.parameters())
                    .unwrap();
                black_box(sql)
            });
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    for customers in [10usize, 100] {
        for kind in [StoreKind::Document, StoreKind::Relational] {
            let session = customers_session(kind);
            populate(&session, customers, 2);
            session.save_changes().unwrap();
            let query = session.query("Customer").unwrap().as_no_tracking();
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}"), customers),
                &query,
                |b, query| b.iter(|| black_box(session.to_list(query).unwrap())),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_translate, bench_execute);
criterion_main!(benches);
