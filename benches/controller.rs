use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use playsync::control::{CascadeController, ControlParameters, FeedbackController, Gains};
use playsync::protocol::{ConnectionType, NetworkNode};
use playsync::sync::{network_entropy, network_free_energy};

fn nodes(count: usize) -> Vec<NetworkNode> {
    (0..count)
        .map(|i| NetworkNode {
            id: format!("node-{i}"),
            latency: 20.0 + i as f64 * 3.0,
            sync_error: (i as f64 * 0.37).sin() * 0.2,
            playback_rate: 1.0 + (i as f64 * 0.11).cos() * 0.05,
            connection_type: ConnectionType::Relay,
        })
        .collect()
}

fn bench_controllers(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller");

    group.bench_function("feedback_compute", |b| {
        let mut pid = FeedbackController::new(Gains::default());
        b.iter(|| criterion::black_box(pid.compute(10.0, 9.2)));
    });

    group.bench_function("cascade_compute", |b| {
        let mut cascade = CascadeController::new(ControlParameters::default());
        b.iter(|| criterion::black_box(cascade.compute(0.0, 0.3, 0.4)));
    });

    group.bench_function("network_metrics_64", |b| {
        b.iter_batched(
            || nodes(64),
            |nodes| {
                let entropy = network_entropy(&nodes);
                let free_energy = network_free_energy(&nodes);
                criterion::black_box((entropy, free_energy))
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_controllers);
criterion_main!(benches);
