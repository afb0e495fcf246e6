use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pixfetch::core::WorkQueue;
use pixfetch::request::Priority;

fn bench_enqueue_dispatch_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("queue_enqueue_dispatch_1000", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let queue = WorkQueue::new(8);
                let counter = Arc::new(AtomicUsize::new(0));
                for index in 0..1000usize {
                    let counter = counter.clone();
                    let priority = match index % 3 {
                        0 => Priority::Low,
                        1 => Priority::Normal,
                        _ => Priority::High,
                    };
                    queue.enqueue(priority, move |_ctx| async move {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                while counter.load(Ordering::Relaxed) < 1000 {
                    tokio::task::yield_now().await;
                }
                black_box(counter.load(Ordering::Relaxed))
            })
        })
    });
}

fn bench_priority_updates(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("queue_priority_update_pending", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let queue = WorkQueue::new(1);
                queue.set_suspended(true);
                let items: Vec<_> = (0..256)
                    .map(|_| queue.enqueue(Priority::Normal, |_ctx| async {}))
                    .collect();
                for item in &items {
                    item.set_priority(Priority::High);
                }
                black_box(queue.pending_count())
            })
        })
    });
}

criterion_group!(benches, bench_enqueue_dispatch_throughput, bench_priority_updates);
criterion_main!(benches);
