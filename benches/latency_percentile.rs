//! Latency percentile benchmark.
//!
//! Measures the cost of answering the report percentiles over one window
//! of weighted samples using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use htc_agent::stats::{LatencyDistribution, Percentiles};
use std::time::Duration;

fn filled(samples: usize) -> LatencyDistribution {
    let mut dist = LatencyDistribution::new();
    for i in 0..samples {
        // Spread durations so the sort has real work to do.
        let micros = (i as u64).wrapping_mul(7919) % 250_000;
        dist.add(1 + (i % 3) as u32, Duration::from_micros(micros));
    }
    dist
}

fn bench_percentiles(c: &mut Criterion) {
    let targets = Percentiles::report();
    let sizes: &[usize] = &[16, 1024, 16_384, 131_072];

    let mut group = c.benchmark_group("percentiles");
    for &size in sizes {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.iter_batched(
                || filled(n),
                |mut dist| dist.percentiles(black_box(&targets)),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_add(c: &mut Criterion) {
    c.bench_function("add_1024", |b| {
        b.iter(|| {
            let mut dist = LatencyDistribution::new();
            for i in 0..1024u64 {
                dist.add(1, black_box(Duration::from_micros(i)));
            }
            dist
        });
    });
}

criterion_group!(benches, bench_percentiles, bench_add);
criterion_main!(benches);
