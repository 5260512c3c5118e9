use criterion::{black_box, criterion_group, criterion_main, Criterion};
use eval_broker::{BrokerConfig, EvalBroker, Evaluation};
use std::sync::Arc;
use std::time::Duration;

fn bench_config() -> BrokerConfig {
    BrokerConfig {
        nack_timeout: Duration::from_secs(60),
        delivery_limit: 3,
        initial_nack_delay: Duration::from_secs(5),
        subsequent_nack_delay: Duration::from_secs(60),
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");

    group.bench_function("distinct_jobs", |b| {
        let broker = EvalBroker::new(bench_config()).unwrap();
        broker.set_enabled(true);
        let mut next = 0u64;

        b.iter(|| {
            next += 1;
            let eval = Arc::new(Evaluation::new(
                format!("eval-{next}"),
                "default",
                format!("job-{next}"),
                "service",
                50,
                next,
            ));
            broker.enqueue(black_box(eval));
        });

        broker.set_enabled(false);
    });

    group.finish();
}

fn bench_dispatch_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_cycle");

    group.bench_function("enqueue_dequeue_ack", |b| {
        let broker = EvalBroker::new(bench_config()).unwrap();
        broker.set_enabled(true);
        let mut next = 0u64;

        b.iter(|| {
            next += 1;
            let id = format!("eval-{next}");
            broker.enqueue(Arc::new(Evaluation::new(
                id.clone(),
                "default",
                format!("job-{next}"),
                "service",
                50,
                next,
            )));
            let (delivered, token) = broker
                .dequeue(&["service"], Duration::from_secs(1))
                .unwrap()
                .unwrap();
            broker.ack(black_box(&delivered.id), &token).unwrap();
            assert_eq!(delivered.id, id);
        });

        broker.set_enabled(false);
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_dispatch_cycle);
criterion_main!(benches);
