use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forge_rt::{BlockHeap, HeapConfig, ShardedHeap};
use std::sync::Arc;
use std::thread;

fn config() -> HeapConfig {
    HeapConfig { size_classes: vec![16, 32, 64, 128, 256, 512, 1024], data_page_size: 65536 }
}

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("BlockHeap Single Thread");
    const BATCH: usize = 200;

    group.bench_function("alloc/free same class", |b| {
        let mut heap = BlockHeap::new(&config());
        b.iter(|| {
            let mut ptrs = Vec::with_capacity(BATCH);
            for _ in 0..BATCH {
                ptrs.push(heap.alloc(black_box(64), black_box(8)).unwrap());
            }
            for p in ptrs {
                unsafe { heap.free(p) };
            }
        });
    });

    group.bench_function("alloc/free direct (oversized)", |b| {
        let mut heap = BlockHeap::new(&config());
        b.iter(|| {
            let p = heap.alloc(black_box(1 << 20), black_box(8)).unwrap();
            unsafe { heap.free(p) };
        });
    });

    group.bench_function("std alloc/dealloc baseline", |b| {
        b.iter(|| {
            let mut ptrs = Vec::with_capacity(BATCH);
            for _ in 0..BATCH {
                ptrs.push(Box::new([0u8; 64]));
            }
            black_box(&ptrs);
            ptrs.clear();
        });
    });
}

fn bench_sharded_multi_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ShardedHeap Multi Thread");
    group.sample_size(10);
    const THREADS: usize = 4;
    const OPS: usize = 2000;

    group.bench_function("sharded alloc/free contention", |b| {
        b.iter(|| {
            let heap = Arc::new(ShardedHeap::new(&config(), THREADS));
            thread::scope(|s| {
                for _ in 0..THREADS {
                    let heap = heap.clone();
                    s.spawn(move || {
                        for _ in 0..OPS {
                            let p = heap.alloc(64, 8).unwrap();
                            unsafe { heap.free(p) };
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(benches, bench_single_thread, bench_sharded_multi_thread);
criterion_main!(benches);
