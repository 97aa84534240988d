use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forge_rt::MpmcQueue;
use std::sync::Arc;
use std::thread;

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("MpmcQueue Single Thread");

    group.bench_function("enqueue/dequeue round trip", |b| {
        let q = MpmcQueue::<u64>::new(1024);
        b.iter(|| {
            q.enqueue(black_box(42)).unwrap();
            black_box(q.dequeue().unwrap());
        });
    });

    group.bench_function("std Mutex<VecDeque> baseline", |b| {
        use std::collections::VecDeque;
        use std::sync::Mutex;
        let q = Mutex::new(VecDeque::with_capacity(1024));
        b.iter(|| {
            q.lock().unwrap().push_back(black_box(42u64));
            black_box(q.lock().unwrap().pop_front().unwrap());
        });
    });
}

fn bench_mpmc_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("MpmcQueue MPMC Contention");
    group.sample_size(10);
    const PRODUCERS: usize = 3;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: u64 = 5000;

    group.bench_function("3p3c drain", |b| {
        b.iter(|| {
            let q = Arc::new(MpmcQueue::<u64>::new(4096));
            thread::scope(|s| {
                for _ in 0..PRODUCERS {
                    let q = q.clone();
                    s.spawn(move || {
                        for i in 0..PER_PRODUCER {
                            while q.enqueue(i).is_err() {
                                std::hint::spin_loop();
                            }
                        }
                    });
                }
                let total = PRODUCERS as u64 * PER_PRODUCER;
                let consumed = Arc::new(std::sync::atomic::AtomicU64::new(0));
                for _ in 0..CONSUMERS {
                    let q = q.clone();
                    let consumed = consumed.clone();
                    s.spawn(move || {
                        while consumed.load(std::sync::atomic::Ordering::Relaxed) < total {
                            if q.dequeue().is_ok() {
                                consumed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(benches, bench_single_thread, bench_mpmc_contention);
criterion_main!(benches);
