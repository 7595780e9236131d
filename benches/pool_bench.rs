use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use workpool::{Pool, PoolScheduler, Settings, TaskScheduler};

fn submit_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");

    for threads in [1, 2, 4] {
        group.bench_function(format!("{}-threads", threads), |b| {
            b.iter_batched(
                || Pool::new(Settings::new(threads).unwrap()),
                |pool| {
                    let counter = Arc::new(AtomicUsize::new(0));
                    for _ in 0..1000 {
                        let counter = Arc::clone(&counter);
                        pool.submit(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                    pool.close();
                    pool.wait_for_exit(None);
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn scheduler_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    group.bench_function("queue-1000", |b| {
        b.iter_batched(
            || {
                let pool = Pool::new(Settings::new(2).unwrap());
                let scheduler = PoolScheduler::new(pool.clone());
                (pool, scheduler)
            },
            |(pool, scheduler)| {
                let counter = Arc::new(AtomicUsize::new(0));
                for _ in 0..1000 {
                    let counter = Arc::clone(&counter);
                    scheduler.queue(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                pool.close();
                pool.wait_for_exit(None);
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, submit_bench, scheduler_bench);
criterion_main!(benches);
