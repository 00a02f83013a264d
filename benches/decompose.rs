use criterion::{black_box, criterion_group, criterion_main, Criterion};

use clustersim_collectives::generator::PhaseGenerator;
use clustersim_core::types::{CollectiveKind, CollectiveOptimization, InterDimPolicy};

fn bench_decompose(c: &mut Criterion) {
    let dims = vec![(0usize, 8usize), (1, 4), (2, 2)];

    c.bench_function("split_chunks_64MiB", |b| {
        b.iter(|| PhaseGenerator::split_chunks(black_box(64 << 20), black_box(16)))
    });

    c.bench_function("plan_chunk_local_bw_aware", |b| {
        b.iter(|| {
            PhaseGenerator::plan_chunk(
                CollectiveKind::AllReduce,
                black_box(4 << 20),
                black_box(&dims),
                CollectiveOptimization::LocalBwAware,
            )
        })
    });

    c.bench_function("traversal_order_round_robin", |b| {
        b.iter(|| {
            PhaseGenerator::traversal_order(
                CollectiveKind::AllReduce,
                InterDimPolicy::RoundRobin,
                black_box(dims.clone()),
                black_box(7),
                &[100.0, 25.0, 12.5],
            )
        })
    });
}

criterion_group!(benches, bench_decompose);
criterion_main!(benches);
