use crate::nn::sparse::{SparseLinear, SparsityHParams, SparsityMode, SparsityType};
use crate::nn::{Linear, Module};
use crate::tensor::Tensor;
use ndarray::arr2;

fn fixture_weight() -> ndarray::ArrayD<f32> {
    arr2(&[[1.0f32, 2.0, 3.0, 4.0], [-3.0, -4.0, 1.0, 2.0]]).into_dyn()
}

#[test]
fn inference_matches_dense_linear() {
    let sparse = SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Inference))
        .unwrap();
    let dense = Linear::new(2, 4, false);
    sparse.inner.weight.lock().data = fixture_weight();
    dense.weight.lock().data = fixture_weight();

    let input = Tensor::new(arr2(&[[0.5f32, -1.5], [2.0, 0.25]]).into_dyn(), false);
    let out_s = sparse.forward(&input);
    let out_d = dense.forward(&input);
    assert_eq!(out_s.lock().data, out_d.lock().data);
    assert!(sparse.mask().is_none());
}

#[test]
fn materialize_projects_with_pruned_weight() {
    let sparse =
        SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Materialize))
            .unwrap();
    sparse.inner.weight.lock().data = fixture_weight();

    let input = Tensor::new(arr2(&[[1.0f32, 1.0]]).into_dyn(), false);
    let out = sparse.forward(&input);
    // Masked weight is [[0,0,3,4],[-3,-4,0,0]]
    let expected = arr2(&[[-3.0f32, -4.0, 3.0, 4.0]]).into_dyn();
    assert_eq!(out.lock().data, expected);

    let mask = sparse.mask().unwrap();
    let expected_mask = arr2(&[[0.0f32, 0.0, 1.0, 1.0], [1.0, 1.0, 0.0, 0.0]]).into_dyn();
    assert_eq!(mask.lock().data, expected_mask);
}

#[test]
fn mask_is_not_a_trainable_parameter() {
    let sparse =
        SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
            .unwrap();
    assert_eq!(sparse.parameters().len(), 1);
    let state = sparse.named_state("layer");
    let names: Vec<&str> = state.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec!["layer.weight_sparsity_mask", "layer.mask_update_count"]
    );
}

#[test]
fn unstructured_sparsity_is_rejected() {
    let mut hp = SparsityHParams::structured_nm(2, 4, SparsityMode::Training);
    hp.sparsity_type = SparsityType::Unstructured;
    assert!(SparseLinear::new(2, 4, hp).is_err());
}

#[test]
fn invalid_prune_rates_are_rejected() {
    assert!(SparseLinear::new(2, 4, SparsityHParams::structured_nm(5, 4, SparsityMode::Training))
        .is_err());
    assert!(SparseLinear::new(2, 4, SparsityHParams::structured_nm(2, 0, SparsityMode::Training))
        .is_err());
    // 2*3 = 6 elements do not divide into groups of 4
    assert!(SparseLinear::new(2, 3, SparsityHParams::structured_nm(2, 4, SparsityMode::Training))
        .is_err());
}

#[test]
fn inference_mode_skips_group_size_check() {
    // No mask is ever computed, so an indivisible weight is fine
    assert!(SparseLinear::new(2, 3, SparsityHParams::structured_nm(2, 4, SparsityMode::Inference))
        .is_ok());
}
