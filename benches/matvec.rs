use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use rnnlm_rs::matvec;
use rnnlm_rs::network::Neuron;

fn bench_matvec(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    // Roughly a 10k-word vocabulary with 200 hidden units.
    let width = 10_200;
    let rows = 200;
    let matrix: Vec<f64> = (0..rows * width)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    let src: Vec<Neuron> = (0..width)
        .map(|_| Neuron {
            ac: rng.random_range(-1.0..1.0),
            er: rng.random_range(-1.0..1.0),
        })
        .collect();

    c.bench_function("forward_recurrent_block", |b| {
        let mut dest = vec![Neuron::default(); rows];
        b.iter(|| {
            for n in &mut dest {
                n.ac = 0.0;
            }
            matvec::forward(
                black_box(&mut dest),
                black_box(&src),
                black_box(&matrix),
                width,
                0..rows,
                10_000..width,
            );
        });
    });

    c.bench_function("backward_feedback_block", |b| {
        let mut dest = vec![Neuron::default(); width];
        let src_err: Vec<Neuron> = src.clone();
        b.iter(|| {
            for n in &mut dest[10_000..] {
                n.er = 0.0;
            }
            matvec::backward(
                black_box(&mut dest),
                black_box(&src_err),
                black_box(&matrix),
                width,
                0..rows,
                10_000..width,
                15.0,
            );
        });
    });
}

criterion_group!(benches, bench_matvec);
criterion_main!(benches);
