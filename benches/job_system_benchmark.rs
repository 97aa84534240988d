use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forge_rt::{JobSystem, JobSystemConfig};
use std::sync::Arc;

fn noop(_: &u32, _: &forge_rt::JobInterface<'_>) {
    black_box(());
}

fn bench_single_job_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("JobSystem Single Job");
    group.sample_size(20);

    group.bench_function("schedule + wait, no deps", |b| {
        let system = Arc::new(JobSystem::new(&JobSystemConfig { num_jobs: 256, num_workers: 2 }));
        system.startup();
        b.iter(|| {
            let id = system.schedule(0u32, noop, &[]);
            system.wait(id).unwrap();
        });
        system.shutdown();
    });
}

fn bench_dependency_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("JobSystem Dependency Chain");
    group.sample_size(10);
    const CHAIN_LEN: usize = 50;

    group.bench_function("50-deep linear chain", |b| {
        let system = Arc::new(JobSystem::new(&JobSystemConfig { num_jobs: 256, num_workers: 4 }));
        system.startup();
        b.iter(|| {
            let mut prev = system.schedule(0u32, noop, &[]);
            for _ in 1..CHAIN_LEN {
                prev = system.schedule(0u32, noop, &[prev]);
            }
            system.wait(prev).unwrap();
        });
        system.shutdown();
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("JobSystem Fan Out");
    group.sample_size(10);
    const WIDTH: usize = 64;

    group.bench_function("64-way fan-out then join", |b| {
        let system = Arc::new(JobSystem::new(&JobSystemConfig { num_jobs: 256, num_workers: 4 }));
        system.startup();
        b.iter(|| {
            let children: Vec<_> = (0..WIDTH as u32).map(|i| system.schedule(i, noop, &[])).collect();
            let join = system.schedule(0u32, noop, &children);
            system.wait(join).unwrap();
        });
        system.shutdown();
    });
}

criterion_group!(benches, bench_single_job_roundtrip, bench_dependency_chain, bench_fan_out);
criterion_main!(benches);
