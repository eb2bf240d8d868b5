use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use engine_gate::{
    DrainPolicy, DurableStore, EngineGate, GateConfig, MemoryEngineFactory, NativeValue, ProcessLockCoordinator,
};

fn make_gate(drain: DrainPolicy) -> EngineGate {
    let mut config = GateConfig::default();
    config.drain = drain;
    let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
        .config(config)
        .coordinator(Arc::new(ProcessLockCoordinator::new()))
        .build()
        .unwrap();
    // Build and populate outside the measured region.
    gate.before_request().unwrap();
    gate
}

fn bench_single_unit_latency(c: &mut Criterion) {
    let gate = make_gate(DrainPolicy::default());

    c.bench_function("dispatch/single_unit_roundtrip", |b| {
        b.iter(|| {
            gate.enqueue(|_, args| Ok(args.len()), vec![NativeValue::Int(1)])
                .join()
                .unwrap()
        });
    });
}

fn bench_batched_throughput(c: &mut Criterion) {
    const BATCH: u64 = 256;
    let gate = make_gate(DrainPolicy::default());

    let mut group = c.benchmark_group("dispatch/batched");
    group.throughput(Throughput::Elements(BATCH));
    group.bench_function("enqueue_then_join", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let start = Instant::now();
                let tickets: Vec<_> = (0..BATCH)
                    .map(|i| {
                        gate.enqueue(
                            move |engine, _| {
                                engine.write_file("/persist/bench", &i.to_le_bytes())?;
                                Ok(i)
                            },
                            Vec::new(),
                        )
                    })
                    .collect();
                for ticket in tickets {
                    ticket.join().unwrap();
                }
                total += start.elapsed();
            }
            total
        });
    });
    group.finish();
}

fn bench_flush_cycle(c: &mut Criterion) {
    let gate = make_gate(DrainPolicy::default());

    c.bench_function("dispatch/unit_with_persist", |b| {
        b.iter(|| {
            gate.enqueue(|engine, _| engine.write_file("/persist/state", b"{}"), Vec::new())
                .join()
                .unwrap();
            gate.after_request().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_single_unit_latency,
    bench_batched_throughput,
    bench_flush_cycle
);
criterion_main!(benches);
