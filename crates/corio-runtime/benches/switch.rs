//! Context switch and timer set throughput

use corio_runtime::{Fiber, TimerManager};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn bench_resume_yield(c: &mut Criterion) {
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    let fiber = Fiber::new(
        move || {
            while !d.load(Ordering::Relaxed) {
                Fiber::yield_now();
            }
        },
        0,
        false,
    );

    c.bench_function("fiber_resume_yield", |b| b.iter(|| fiber.resume()));

    done.store(true, Ordering::Relaxed);
    fiber.resume();
}

fn bench_fiber_create(c: &mut Criterion) {
    c.bench_function("fiber_create_run", |b| {
        b.iter(|| {
            let fiber = Fiber::new(|| {}, 0, false);
            fiber.resume();
            black_box(fiber.id())
        })
    });
}

fn bench_timer_add_cancel(c: &mut Criterion) {
    let timers = TimerManager::new();
    // keep a populated set so inserts hit a non-trivial tree
    let _background: Vec<_> = (0..1000).map(|i| timers.add_timer(60_000 + i, || {}, false)).collect();

    c.bench_function("timer_add_cancel", |b| {
        b.iter(|| {
            let timer = timers.add_timer(black_box(500), || {}, false);
            timer.cancel()
        })
    });
}

criterion_group!(benches, bench_resume_yield, bench_fiber_create, bench_timer_add_cancel);
criterion_main!(benches);
