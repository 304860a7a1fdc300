//! Criterion benchmarks for the core engine operations.
//!
//! Run with: `cargo bench`
//!
//! Measures bulk insert, opaque-id lookup, criteria scans, and sorted reads
//! against tables of increasing size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use inibase::codec::FieldKind;
use inibase::query::{Options, Where};
use inibase::schema::Field;
use inibase::Engine;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

async fn fresh_engine(dir: &std::path::Path) -> (Engine, tempfile::TempDir) {
    let tmp = tempfile::tempdir_in(dir).unwrap();
    std::env::remove_var("INIBASE_SECRET");
    let engine = Engine::new(tmp.path()).await.unwrap();
    engine
        .create_table(
            "users",
            vec![Field::scalar(0, "username", FieldKind::String), Field::scalar(0, "age", FieldKind::Number)],
        )
        .await
        .unwrap();
    (engine, tmp)
}

fn bench_post(c: &mut Criterion) {
    let rt = runtime();
    let root = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("post");

    for count in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &n| {
            b.to_async(&rt).iter(|| async {
                let (engine, _tmp) = fresh_engine(root.path()).await;
                let records: Vec<_> = (0..n).map(|i| json!({"username": format!("user_{i}"), "age": i % 90})).collect();
                black_box(engine.post("users", records).await.unwrap());
            });
        });
    }
    group.finish();
}

fn bench_get_by_opaque_id(c: &mut Criterion) {
    let rt = runtime();
    let root = tempfile::tempdir().unwrap();

    let (engine, _tmp, ids) = rt.block_on(async {
        let (engine, tmp) = fresh_engine(root.path()).await;
        let records: Vec<_> = (0..10_000).map(|i| json!({"username": format!("user_{i}"), "age": i % 90})).collect();
        let ids = engine.post("users", records).await.unwrap();
        (engine, tmp, ids)
    });

    c.bench_function("get_by_opaque_id_10k", |b| {
        let mut idx = 0usize;
        b.to_async(&rt).iter(|| {
            idx += 1;
            let id = ids[idx % ids.len()].clone();
            let engine = &engine;
            async move {
                black_box(engine.get("users", Some(Where::Id(id)), Options::default(), true, false).await.unwrap());
            }
        });
    });
}

fn bench_criteria_scan(c: &mut Criterion) {
    use inibase::criteria;

    let rt = runtime();
    let root = tempfile::tempdir().unwrap();

    let (engine, _tmp) = rt.block_on(async {
        let (engine, tmp) = fresh_engine(root.path()).await;
        let records: Vec<_> = (0..10_000).map(|i| json!({"username": format!("user_{i}"), "age": i % 90})).collect();
        engine.post("users", records).await.unwrap();
        (engine, tmp)
    });

    c.bench_function("criteria_scan_age_gt_80_of_10k", |b| {
        b.to_async(&rt).iter(|| async {
            let criteria = criteria::from_json(&json!({"age": ">80"})).unwrap();
            black_box(
                engine
                    .get("users", Some(Where::Criteria(criteria)), Options { per_page: 10_000, ..Default::default() }, false, false)
                    .await
                    .unwrap(),
            );
        });
    });
}

fn bench_sorted_page(c: &mut Criterion) {
    use inibase::query::SortSpec;

    let rt = runtime();
    let root = tempfile::tempdir().unwrap();

    let (engine, _tmp) = rt.block_on(async {
        let (engine, tmp) = fresh_engine(root.path()).await;
        let records: Vec<_> = (0..10_000).map(|i| json!({"username": format!("user_{i}"), "age": (i * 37) % 90})).collect();
        engine.post("users", records).await.unwrap();
        (engine, tmp)
    });

    c.bench_function("sorted_page_1_of_10k", |b| {
        b.to_async(&rt).iter(|| async {
            let sort = SortSpec::from_json(&json!("age")).unwrap();
            let options = Options { sort: Some(sort), ..Default::default() };
            black_box(engine.get("users", None, options, false, false).await.unwrap());
        });
    });
}

criterion_group!(engine_benches, bench_post, bench_get_by_opaque_id, bench_criteria_scan, bench_sorted_page,);

criterion_main!(engine_benches);
