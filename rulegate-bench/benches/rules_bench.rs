//! Rule pipeline benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rulegate_core::{
    Action, Condition, EvaluateOptions, ExprEngine, ExpressionEvaluator, Operation, Rule,
    RuleCategory, RuleContext, RuleEngine, RuleRegistry,
};
use serde_json::json;
use std::sync::Arc;

/// A chain of `n` validation rules where each depends on the previous one.
fn chained_registry(n: usize) -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    for i in 0..n {
        let mut rule = Rule::new(
            format!("order.rule_{}", i),
            "order",
            RuleCategory::Validation,
            Condition::expression("data.total > 10 && len(data.items) > 0"),
            Action::Allow,
        )
        .with_priority((i % 7) as i32);
        if i > 0 {
            rule.depends_on = vec![format!("order.rule_{}", i - 1)];
        }
        registry.register(rule).unwrap();
    }
    registry
}

fn context() -> RuleContext {
    RuleContext::new(
        "order",
        Operation::Update,
        json!({"total": 42, "items": [1, 2, 3], "customer": {"tier": "gold"}}),
    )
    .with_user("u-1", &["client"])
}

fn bench_evaluate_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_evaluate");

    for size in [10, 50, 200] {
        let engine = RuleEngine::new(Arc::new(chained_registry(size)));
        let ctx = context();
        let options = EvaluateOptions::default();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("rules", size), &size, |b, _| {
            b.iter(|| black_box(engine.evaluate_rules(&ctx, &options)));
        });
    }

    group.finish();
}

fn bench_execution_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_order");

    for size in [50, 500] {
        let engine = RuleEngine::new(Arc::new(chained_registry(size)));
        group.bench_with_input(BenchmarkId::new("topo_sort", size), &size, |b, _| {
            b.iter(|| black_box(engine.execution_order("order", None)));
        });
    }

    group.finish();
}

fn bench_expressions(c: &mut Criterion) {
    let mut group = c.benchmark_group("expr_evaluate");
    let engine = ExprEngine::new();
    let scope = context().scope().build();

    group.bench_function("cached_boolean", |b| {
        b.iter(|| {
            black_box(
                engine
                    .evaluate_boolean(
                        "user.roles includes 'client' && data.customer.tier == 'gold'",
                        &scope,
                    )
                    .unwrap(),
            )
        });
    });

    group.bench_function("arithmetic", |b| {
        b.iter(|| black_box(engine.evaluate("(data.total * 3 + 7) % 5", &scope).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate_rules, bench_execution_order, bench_expressions);
criterion_main!(benches);
