//! State machine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rulegate_core::machine::{State, StateAction, Transition};
use rulegate_core::{StateMachine, StateMachineConfig, TransitionContext};
use serde_json::json;
use tokio::runtime::Runtime;

fn order_machine() -> StateMachineConfig {
    StateMachineConfig::new(
        "order",
        vec![
            State::new("active"),
            State::new("created").child_of("active").initial(),
            State::new("processing").child_of("active").on_entry(StateAction::Compute {
                field: "due".into(),
                expression: "data.total * 2".into(),
            }),
            State::new("completed").terminal(),
            State::new("cancelled").terminal(),
        ],
        vec![
            Transition::new("start", "created", "processing")
                .on_event("START")
                .with_guard("has_total", "data.total > 0", "order is empty"),
            Transition::new("complete", "processing", "completed").on_event("COMPLETE"),
            Transition::new("cancel", "active", "cancelled").on_event("CANCEL"),
        ],
    )
}

fn bench_transition(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let machine = StateMachine::new(order_machine()).unwrap();
    let ctx = TransitionContext::new("order", "o-1", json!({"total": 42}));

    let mut group = c.benchmark_group("machine_transition");
    group.throughput(Throughput::Elements(1));

    group.bench_function("named", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(machine.transition("created", "start", &ctx).await) });
    });

    group.bench_function("send_bubbled", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(machine.send("processing", "CANCEL", &ctx, None).await) });
    });

    group.finish();
}

fn bench_construct(c: &mut Criterion) {
    let config = order_machine();
    c.bench_function("machine_construct", |b| {
        b.iter(|| black_box(StateMachine::new(config.clone()).unwrap()));
    });
}

fn bench_mermaid(c: &mut Criterion) {
    let machine = StateMachine::new(order_machine()).unwrap();
    c.bench_function("machine_to_mermaid", |b| b.iter(|| black_box(machine.to_mermaid())));
}

criterion_group!(benches, bench_transition, bench_construct, bench_mermaid);
criterion_main!(benches);
