//! Trial lifecycle benchmarks
//!
//! - One trial over graphs of increasing width (sequential executor)
//! - Metric save/load on the memory and local backends
//! - History export to Arrow

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use trialbook::{Experiment, Node, StepError};

fn memory(id: &str) -> Arc<Experiment> {
    Experiment::builder(id)
        .backend("memory://")
        .environment(Vec::new())
        .build()
        .unwrap()
}

fn bench_trial_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("trial_width");

    for width in [1usize, 16, 128] {
        let exp = memory("bench_width");
        let a = exp.parameter("a", Some(json!(3))).unwrap();
        let square = exp.step("square", |args| {
            let a = args[0].as_i64().unwrap_or(0);
            Ok(json!(a * a))
        });
        let sum = exp.result("sum", |args| {
            Ok(json!(args.iter().filter_map(serde_json::Value::as_i64).sum::<i64>()))
        });
        let node = sum.call((0..width).map(|_| square.call([&a])).collect::<Vec<Node>>());

        group.bench_with_input(BenchmarkId::from_parameter(width), &node, |b, node| {
            b.iter(|| black_box(node.compute().unwrap()));
        });
    }

    group.finish();
}

#[allow(clippy::cast_precision_loss)]
fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    let dir = tempfile::tempdir().unwrap();

    let experiments = [
        ("memory", memory("bench_metrics")),
        (
            "local",
            Experiment::builder("bench_metrics")
                .cache_root(dir.path())
                .environment(Vec::new())
                .build()
                .unwrap(),
        ),
    ];

    for (name, exp) in experiments {
        let weak = Arc::downgrade(&exp);
        let node = exp
            .result("train", move |_| {
                let exp = weak.upgrade().ok_or_else(|| StepError::new("Gone", "experiment dropped"))?;
                for epoch in 0..100u64 {
                    exp.save_metric("loss", epoch, 1.0 / (epoch + 1) as f64)
                        .map_err(|e| StepError::new(e.kind(), e.to_string()))?;
                }
                Ok(json!(null))
            })
            .call(Vec::<Node>::new());

        group.bench_function(BenchmarkId::new("save_100", name), |b| {
            b.iter(|| node.compute().unwrap());
        });

        let ids: Vec<u64> = (1..=exp.trial_id().unwrap().min(10)).collect();
        group.bench_function(BenchmarkId::new("load_10_trials", name), |b| {
            b.iter(|| black_box(exp.load_metric("loss", &ids).unwrap()));
        });
    }

    group.finish();
}

fn bench_history_export(c: &mut Criterion) {
    let exp = memory("bench_history");
    let a = exp.parameter("a", None).unwrap();
    let node = exp.result("id", |args| Ok(args[0].clone())).call([&a]);
    for v in 0..500 {
        exp.set_parameters([("a", json!(v))]).unwrap();
        node.compute().unwrap();
    }

    c.bench_function("history_to_record_batch_500", |b| {
        b.iter(|| {
            let history = exp.get_history().unwrap();
            black_box(history.to_record_batch().unwrap())
        });
    });
}

criterion_group!(benches, bench_trial_width, bench_metrics, bench_history_export);
criterion_main!(benches);
