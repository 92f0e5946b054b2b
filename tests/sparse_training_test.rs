//! Training-mode behavior: masks are recomputed from the live weight each
//! step and gradients reach pruned weight positions as exact zeros.

use ndarray::{arr2, Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sparse_engine::autograd::AutogradEngine;
use sparse_engine::nn::sparse::{
    nm_sparsity_mask, SparseCombinedQKVProjection, SparseLinear, SparsityHParams, SparsityMode,
};
use sparse_engine::nn::{CombinedQKVProjectionConfig, MSELoss, Module, Optimizer, SGD};
use sparse_engine::tensor::Tensor;

fn fixture_weight() -> ArrayD<f32> {
    arr2(&[[1.0f32, 2.0, 3.0, 4.0], [-3.0, -4.0, 1.0, 2.0]]).into_dyn()
}

#[test]
fn pruned_positions_receive_zero_gradient() {
    let layer =
        SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
            .unwrap();
    layer.inner.weight.lock().data = fixture_weight();

    let input = Tensor::new(arr2(&[[1.0f32, -2.0], [0.5, 3.0]]).into_dyn(), false);
    let target = Tensor::new(ArrayD::zeros(IxDyn(&[2, 4])), false);
    let loss = MSELoss::new().forward(&layer.forward(&input), &target);
    AutogradEngine::new().backward(&loss);

    let grad = layer
        .inner
        .weight
        .lock()
        .grad
        .clone()
        .expect("weight should have received a gradient");
    let mask = layer.mask().unwrap().lock().data.clone();
    for (g, m) in grad.iter().zip(mask.iter()) {
        if *m == 0.0 {
            assert_eq!(*g, 0.0, "pruned position must get zero gradient");
        } else {
            assert!(g.abs() > 0.0, "kept position should get a gradient");
        }
    }
}

#[test]
fn sgd_step_then_forward_recomputes_the_mask() {
    let layer =
        SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
            .unwrap();
    layer.inner.weight.lock().data = fixture_weight();

    let mut rng = StdRng::seed_from_u64(99);
    let input = Tensor::new(
        Array::from_shape_fn(IxDyn(&[4, 2]), |_| rng.gen::<f32>() * 2.0 - 1.0),
        false,
    );
    let target = Tensor::new(ArrayD::ones(IxDyn(&[4, 4])), false);
    let mut opt = SGD::new(0.5, 0.0);

    for _ in 0..3 {
        let loss = MSELoss::new().forward(&layer.forward(&input), &target);
        loss.backward();
        opt.step(&layer.parameters());
        opt.zero_grad(&layer.parameters());
    }

    // After the steps, one more forward pass stores a mask consistent with
    // the weight as it now stands.
    layer.forward(&input);
    let (n, m) = layer.sparsity.weight_params.prune_rate;
    let expected = nm_sparsity_mask(&layer.inner.weight.lock().data, n, m).unwrap();
    assert_eq!(layer.mask().unwrap().lock().data, expected);
}

#[test]
fn pruned_weights_stay_fixed_under_masked_gradients() {
    // As long as the mask is stable, pruned positions get zero gradient and
    // SGD leaves them untouched.
    let layer =
        SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
            .unwrap();
    layer.inner.weight.lock().data = fixture_weight();

    let input = Tensor::new(arr2(&[[1.0f32, 1.0]]).into_dyn(), false);
    let target = Tensor::new(ArrayD::zeros(IxDyn(&[1, 4])), false);
    let mut opt = SGD::new(0.01, 0.0);

    let before = layer.inner.weight.lock().data.clone();
    let loss = MSELoss::new().forward(&layer.forward(&input), &target);
    loss.backward();
    let mask = layer.mask().unwrap().lock().data.clone();
    opt.step(&layer.parameters());

    let after = layer.inner.weight.lock().data.clone();
    for ((b, a), m) in before.iter().zip(after.iter()).zip(mask.iter()) {
        if *m == 0.0 {
            assert_eq!(b, a, "pruned weight must not move");
        }
    }
}

#[test]
fn fused_qkv_weight_gets_masked_gradients_through_all_planes() {
    let cfg = CombinedQKVProjectionConfig::new(2, 2, 4);
    let layer = SparseCombinedQKVProjection::new(
        &cfg,
        SparsityHParams::structured_nm(2, 4, SparsityMode::Training),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    layer.inner.weight.lock().data =
        Array::from_shape_fn(IxDyn(&[3, 2, 2, 4]), |_| rng.gen::<f32>() * 2.0 - 1.0);

    let input = Tensor::new(arr2(&[[1.0f32, -1.0]]).into_dyn(), false);
    // Stacked q/k/v output; a scalar loss pulls gradients through every plane
    let loss = layer.forward(&input).pow(2.0).sum();
    loss.backward();

    let grad = layer
        .inner
        .weight
        .lock()
        .grad
        .clone()
        .expect("fused weight should have received a gradient");
    assert_eq!(grad.shape(), &[3, 2, 2, 4]);
    let mask = layer.mask().unwrap().lock().data.clone();
    let mut kept_with_grad = 0usize;
    for (g, m) in grad.iter().zip(mask.iter()) {
        if *m == 0.0 {
            assert_eq!(*g, 0.0);
        } else if g.abs() > 0.0 {
            kept_with_grad += 1;
        }
    }
    assert!(kept_with_grad > 0);
}
