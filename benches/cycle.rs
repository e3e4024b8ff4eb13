use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cyclepool::{CycleConfig, CycleScheduler, DispatchMode, FnWork, WorkStealingDeque, WorkerPool};

fn bench_deque(c: &mut Criterion) {
    let mut group = c.benchmark_group("deque");

    group.bench_function("push/pop 1000", |b| {
        let deque = WorkStealingDeque::new(1024);
        b.iter(|| unsafe {
            for i in 0..1000u32 {
                deque.push(i);
            }
            let mut sum = 0;
            while let Some(v) = deque.pop() {
                sum += v;
            }
            black_box(sum);
        });
    });

    group.finish();
}

fn bench_cycles(c: &mut Criterion) {
    let pool = WorkerPool::builder().build().unwrap();
    let mut scheduler = CycleScheduler::new(pool, CycleConfig::default());

    let mut group = c.benchmark_group("cycle");

    for &num_items in &[100usize, 1_000, 10_000] {
        let items: Vec<u64> = (0..num_items as u64).collect();
        let work = Arc::new(FnWork::new(items, |item: &u64, _thread_index| {
            let mut x = *item;
            for _ in 0..200 {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            }
            black_box(x);
            Ok(())
        }));

        for (name, mode) in [("barrier", DispatchMode::Barrier), ("split", DispatchMode::Split)] {
            group.bench_with_input(BenchmarkId::new(name, num_items), &num_items, |b, _| {
                b.iter(|| {
                    let report = scheduler.run_cycle(&work, 2, mode);
                    assert!(report.completed);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_deque, bench_cycles);
criterion_main!(benches);
