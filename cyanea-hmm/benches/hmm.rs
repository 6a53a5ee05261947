use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cyanea_hmm::{BaumWelchMode, CachePolicy, Hmm, HmmConfig, SequenceSet, TimeIndex};

fn random_sequences(count: usize, len: usize, m: u16, seed: u64) -> SequenceSet {
    let mut state = seed;
    (0..count)
        .map(|_| {
            (0..len)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    ((state >> 33) % m as u64) as u16
                })
                .collect()
        })
        .collect()
}

fn bound_model(n: usize, m: u16, count: usize, len: usize, config: HmmConfig) -> Hmm {
    let mut hmm = Hmm::random(n, m as usize, config).unwrap();
    hmm.bind_observations(Arc::new(random_sequences(count, len, m, 42)))
        .unwrap();
    hmm
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");

    let uncached = HmmConfig {
        cache: CachePolicy::Disabled,
        ..Default::default()
    };
    let mut hmm = bound_model(20, 4, 1, 1_000, uncached);
    group.bench_function("n20_t1000", |b| {
        b.iter(|| hmm.forward(black_box(TimeIndex::Total), 0, 0).unwrap())
    });

    group.finish();
}

fn bench_viterbi(c: &mut Criterion) {
    let mut group = c.benchmark_group("viterbi");

    let uncached = HmmConfig {
        cache: CachePolicy::Disabled,
        ..Default::default()
    };
    let mut hmm = bound_model(20, 4, 1, 1_000, uncached);
    group.bench_function("n20_t1000", |b| b.iter(|| hmm.best_path(black_box(0)).unwrap()));

    group.finish();
}

fn bench_baum_welch(c: &mut Criterion) {
    let mut group = c.benchmark_group("baum_welch");
    group.sample_size(10);

    for threads in [1, 4] {
        let config = HmmConfig {
            parallelism: threads,
            ..Default::default()
        };
        let mut hmm = bound_model(8, 4, 64, 200, config);
        hmm.set_convergence_criteria(1, 0.0);
        group.bench_function(format!("one_step_64x200_threads{threads}"), |b| {
            b.iter(|| hmm.train_baum_welch(BaumWelchMode::Full).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_viterbi, bench_baum_welch);
criterion_main!(benches);
