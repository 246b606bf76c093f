//! Benchmark suite for masking operations
//!
//! Measures the scalar strategies, the fingerprint cache, and the
//! batched parallel apply at realistic vocabulary sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use bozal::engine::MaskingEngine;
use bozal::mask::{keep_allowed, suppress_disallowed};
use bozal::testing::MockGrammarEngine;
use bozal::{apply_bitmask_batch, TokenBitmask};

const VOCAB: usize = 32_000;

/// Every 100th id: a sparse list for whichever side the path scatters
fn every_100th(vocab: usize) -> Vec<i64> {
    (0..vocab as i64).filter(|id| id % 100 == 0).collect()
}

fn bench_scalar_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalar");

    let disallowed = every_100th(VOCAB);
    group.bench_function("suppress_sparse_disallowed", |b| {
        let mut logits = vec![0.0f32; VOCAB];
        b.iter(|| suppress_disallowed(black_box(&mut logits), black_box(&disallowed)).unwrap());
    });

    let allowed = every_100th(VOCAB);
    group.bench_function("keep_sparse_allowed", |b| {
        let mut logits = vec![0.0f32; VOCAB];
        b.iter(|| keep_allowed(black_box(&mut logits), black_box(&allowed)).unwrap());
    });

    group.finish();
}

fn bench_engine_cached_step(c: &mut Criterion) {
    // Steady-state decoding: every step after the first hits the cache.
    let disallowed: Vec<u32> = (0..VOCAB as u32).filter(|id| id % 3 != 0).collect();
    let mut engine = MaskingEngine::new(MockGrammarEngine::with_disallowed(VOCAB, &disallowed));
    let mut logits = vec![0.0f32; VOCAB];
    engine.mask_slice(&mut logits).unwrap();

    c.bench_function("engine_mask_cached", |b| {
        b.iter(|| engine.mask_slice(black_box(&mut logits)).unwrap());
    });
}

fn bench_batched_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_apply");

    for rows in [1usize, 8, 32] {
        let mut bitmask = TokenBitmask::zeros(rows, VOCAB);
        for row in 0..rows {
            for id in 0..VOCAB {
                if (id + row) % 3 == 0 {
                    bitmask.set_disallowed(row, id);
                }
            }
        }
        let mut logits = vec![0.0f32; rows * VOCAB];

        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                apply_bitmask_batch(black_box(&mut logits), VOCAB, black_box(&bitmask), None)
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scalar_strategies,
    bench_engine_cached_step,
    bench_batched_apply
);
criterion_main!(benches);
