use criterion::{criterion_group, criterion_main, Criterion};
use std::thread;
use std::time::Instant;
use tricell::{local_rcu, LockFreeMetric};

fn bench(c: &mut Criterion) {
    c.bench_function("exchange pass ping-pong", move |b| {
        b.iter_custom(|iterations| {
            let (mut left, mut right) = tricell::exchange::pair_with(0u64);

            let handle = thread::spawn(move || {
                for i in 0..iterations {
                    *left.value() = i;
                    left.pass();
                }
            });

            let start = Instant::now();
            for _ in 0..iterations {
                right.pass();
            }
            let time = start.elapsed();
            handle.join().unwrap();
            time
        })
    });

    c.bench_function("rcu force_update against a busy reader", move |b| {
        b.iter_custom(|iterations| {
            let (mut reader, mut updater) = local_rcu::pair_with(0u64);

            let handle = thread::spawn(move || {
                for i in 0..iterations {
                    *updater.get_mut() = i;
                    updater.force_update();
                }
            });

            let start = Instant::now();
            for _ in 0..iterations {
                reader.try_read();
                std::hint::black_box(*reader.get_mut());
            }
            let time = start.elapsed();
            handle.join().unwrap();
            time
        })
    });

    c.bench_function("metric update hot path", move |b| {
        let metric = LockFreeMetric::<u64>::new();
        let mut writer = metric.writer();
        b.iter(|| writer.update(1));
        std::hint::black_box(metric.collect());
    });
}

criterion_group!(benches, bench);
criterion_main!(benches);
