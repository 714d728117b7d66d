use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kubext::services::{QueueConfig, WorkQueue};

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("default/wf-{i}")).collect()
}

fn bench_add_get_done(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("work_queue");

    for size in [100usize, 1_000, 10_000] {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("add_get_done", size), &keys, |b, keys| {
            b.to_async(&rt).iter(|| async {
                let queue = WorkQueue::new(QueueConfig::default());
                for key in keys {
                    queue.add(key.as_str());
                }
                while !queue.is_empty() {
                    if let Some(key) = queue.get().await {
                        queue.done(black_box(&key));
                    }
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("add_duplicates", size), &keys, |b, keys| {
            b.iter(|| {
                let queue = WorkQueue::new(QueueConfig::default());
                for _ in 0..4 {
                    for key in keys {
                        queue.add(key.as_str());
                    }
                }
                black_box(queue.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add_get_done);
criterion_main!(benches);
