use crate::nn::{
    AttentionProjection, AttentionProjectionConfig, CombinedQKVProjection,
    CombinedQKVProjectionConfig, Module,
};
use crate::tensor::Tensor;
use ndarray::{arr2, Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_array(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
    Array::from_shape_fn(IxDyn(shape), |_| rng.gen::<f32>() * 4.0 - 2.0)
}

fn assert_all_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tol: f32) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < tol, "{} vs {}", x, y);
    }
}

#[test]
fn input_projection_shape() {
    let proj = AttentionProjection::new(&AttentionProjectionConfig::new(16, 2, 5));
    let input = Tensor::new(ArrayD::zeros(IxDyn(&[5, 16])), false);
    let out = proj.forward(&input);
    assert_eq!(out.lock().data.shape(), &[5, 2, 5]);
}

#[test]
fn output_projection_shape() {
    let mut cfg = AttentionProjectionConfig::new(16, 2, 5);
    cfg.is_output_projection = true;
    let proj = AttentionProjection::new(&cfg);
    let input = Tensor::new(ArrayD::zeros(IxDyn(&[5, 2, 5])), false);
    let out = proj.forward(&input);
    assert_eq!(out.lock().data.shape(), &[5, 16]);
}

#[test]
fn input_projection_matches_manual_contraction() {
    let proj = AttentionProjection::new(&AttentionProjectionConfig::new(2, 2, 2));
    // w[d][n][h]
    let w = ndarray::arr3(&[[[1.0f32, 2.0], [3.0, 4.0]], [[5.0, 6.0], [7.0, 8.0]]]).into_dyn();
    proj.weight.lock().data = w;
    let input = Tensor::new(arr2(&[[1.0f32, 1.0]]).into_dyn(), false);
    let out = proj.forward(&input);
    // out[n][h] = sum_d x_d * w[d][n][h]
    let expected = ndarray::arr3(&[[[6.0f32, 8.0], [10.0, 12.0]]]).into_dyn();
    assert_eq!(out.lock().data, expected);
}

#[test]
fn output_projection_nhd_layout_matches_dnh() {
    let mut rng = StdRng::seed_from_u64(7);
    let (d, n, h) = (6usize, 3usize, 4usize);

    let mut cfg_dnh = AttentionProjectionConfig::new(d, n, h);
    cfg_dnh.is_output_projection = true;
    let proj_dnh = AttentionProjection::new(&cfg_dnh);

    let mut cfg_nhd = cfg_dnh.clone();
    cfg_nhd.use_nhd_shape = true;
    let proj_nhd = AttentionProjection::new(&cfg_nhd);

    let w_dnh = random_array(&[d, n, h], &mut rng);
    // The nhd layout stores the same projection with axes reordered
    let w_nhd = w_dnh
        .view()
        .permuted_axes(vec![1, 2, 0])
        .to_owned()
        .into_dyn();
    proj_dnh.weight.lock().data = w_dnh;
    proj_nhd.weight.lock().data = w_nhd;

    let input = Tensor::new(random_array(&[5, n, h], &mut rng), false);
    let out_dnh = proj_dnh.forward(&input);
    let out_nhd = proj_nhd.forward(&input);
    assert_all_close(&out_dnh.lock().data, &out_nhd.lock().data, 1e-5);
}

#[test]
fn combined_dims_input_projection_matches_unfused_layout() {
    let mut rng = StdRng::seed_from_u64(11);
    let (d, n, h) = (4usize, 2usize, 4usize);

    let proj = AttentionProjection::new(&AttentionProjectionConfig::new(d, n, h));
    let mut cfg_fused = AttentionProjectionConfig::new(d, n, h);
    cfg_fused.attention_combine_dims = true;
    let proj_fused = AttentionProjection::new(&cfg_fused);

    let w = random_array(&[d, n, h], &mut rng);
    let w_fused = w.clone().to_shape(IxDyn(&[d, n * h])).unwrap().to_owned();
    proj.weight.lock().data = w;
    proj_fused.weight.lock().data = w_fused;

    let input = Tensor::new(random_array(&[3, d], &mut rng), false);
    let out = proj.forward(&input);
    let out_fused = proj_fused.forward(&input);
    assert_all_close(&out.lock().data, &out_fused.lock().data, 1e-5);
}

#[test]
fn qkv_projection_shapes_and_stack() {
    let qkv = CombinedQKVProjection::new(&CombinedQKVProjectionConfig::new(8, 2, 4));
    let input = Tensor::new(ArrayD::zeros(IxDyn(&[3, 8])), false);
    let (q, k, v) = qkv.forward_qkv(&input);
    for t in [&q, &k, &v] {
        assert_eq!(t.lock().data.shape(), &[3, 2, 4]);
    }
    let stacked = qkv.forward(&input);
    assert_eq!(stacked.lock().data.shape(), &[3, 3, 2, 4]);
}

#[test]
fn qkv_slices_use_distinct_weight_planes() {
    let qkv = CombinedQKVProjection::new(&CombinedQKVProjectionConfig::new(2, 1, 2));
    // w[k][d][n][h]: q plane all ones, k plane all twos, v plane all threes
    let mut w = ArrayD::zeros(IxDyn(&[3, 2, 1, 2]));
    for (idx, v) in w.indexed_iter_mut() {
        *v = (idx[0] + 1) as f32;
    }
    qkv.weight.lock().data = w;
    let input = Tensor::new(arr2(&[[1.0f32, 1.0]]).into_dyn(), false);
    let (q, k, v) = qkv.forward_qkv(&input);
    assert_eq!(q.lock().data, ArrayD::from_elem(IxDyn(&[1, 1, 2]), 2.0));
    assert_eq!(k.lock().data, ArrayD::from_elem(IxDyn(&[1, 1, 2]), 4.0));
    assert_eq!(v.lock().data, ArrayD::from_elem(IxDyn(&[1, 1, 2]), 6.0));
}
