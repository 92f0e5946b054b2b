use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{Array, IxDyn};
use rand::prelude::*;
use sparse_engine::nn::sparse::{
    nm_sparsity_mask, SparseAttentionProjection, SparsityHParams, SparsityMode,
};
use sparse_engine::nn::{AttentionProjection, AttentionProjectionConfig, Module};
use sparse_engine::tensor::Tensor;

fn bench_mask(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("mask");

    let mut rng = rand::thread_rng();
    for &(d, n, h) in [(64usize, 8usize, 8usize), (256, 16, 16)].iter() {
        let w = Array::from_shape_fn(IxDyn(&[d, n, h]), |_| rng.gen::<f32>() - 0.5);
        group.bench_function(format!("nm_2_4_{}x{}x{}", d, n, h), |b| {
            b.iter(|| std::hint::black_box(nm_sparsity_mask(&w, 2, 4).unwrap()))
        });
    }

    group.finish();
}

fn bench_projection_forward(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("projection_forward");
    group.measurement_time(std::time::Duration::from_secs(1));
    group.warm_up_time(std::time::Duration::from_millis(200));
    group.noise_threshold(0.05);

    let mut rng = rand::thread_rng();
    let cfg = AttentionProjectionConfig::new(256, 16, 16);
    let input = Tensor::new(
        Array::from_shape_fn(IxDyn(&[8, 256]), |_| rng.gen::<f32>() - 0.5),
        false,
    );

    let dense = AttentionProjection::new(&cfg);
    group.bench_function("dense_256_16x16", |b| {
        b.iter(|| std::hint::black_box(dense.forward(&input)))
    });

    let inference =
        SparseAttentionProjection::new(&cfg, SparsityHParams::structured_nm(2, 4, SparsityMode::Inference))
            .unwrap();
    group.bench_function("sparse_inference_256_16x16", |b| {
        b.iter(|| std::hint::black_box(inference.forward(&input)))
    });

    // Training mode pays for a mask recomputation per forward pass
    let training =
        SparseAttentionProjection::new(&cfg, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
            .unwrap();
    group.bench_function("sparse_training_256_16x16", |b| {
        b.iter(|| std::hint::black_box(training.forward(&input)))
    });

    group.finish();
}

criterion_group!(benches, bench_mask, bench_projection_forward);
criterion_main!(benches);
