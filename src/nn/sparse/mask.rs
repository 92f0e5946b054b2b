//! Structured N:M mask computation and per-layer mask state.

use crate::nn::sparse::hparams::{SparsityHParams, SparsityMode};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use std::cmp::Ordering;

/// Computes a structured N:M magnitude mask for a weight tensor.
///
/// The weight is flattened in row-major order and split into groups of `m`
/// elements; within each group the `n` largest-magnitude elements are kept
/// (ties keep the earlier index). The result is a 0/1 tensor with the
/// weight's shape.
pub fn nm_sparsity_mask(weights: &ArrayD<f32>, n: usize, m: usize) -> Result<ArrayD<f32>, String> {
    if m == 0 {
        return Err("group size m must be positive".to_string());
    }
    if n > m {
        return Err(format!(
            "cannot keep {} elements out of groups of {}",
            n, m
        ));
    }
    let len = weights.len();
    if len % m != 0 {
        return Err(format!(
            "weight element count {} is not divisible by group size {}",
            len, m
        ));
    }

    let flat: Vec<f32> = weights.iter().cloned().collect();
    let mut mask = vec![0.0f32; len];
    let mut order: Vec<usize> = Vec::with_capacity(m);
    for group in 0..len / m {
        let start = group * m;
        let values = &flat[start..start + m];
        order.clear();
        order.extend(0..m);
        order.sort_by(|&a, &b| {
            values[b]
                .abs()
                .partial_cmp(&values[a].abs())
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        for &i in order.iter().take(n) {
            mask[start + i] = 1.0;
        }
    }

    ArrayD::from_shape_vec(weights.raw_dim(), mask)
        .map_err(|e| format!("mask shape construction failed: {}", e))
}

/// Zeroes the pruned weight elements by multiplying with a 0/1 mask.
///
/// The mask is non-trainable, so gradients flow to the weight only; pruned
/// positions receive zero gradient through the product.
pub fn apply_sparsity(weight: &Tensor, mask: &Tensor) -> Tensor {
    weight.mul(mask)
}

/// Non-trainable sparsity state carried by a sparsified layer.
///
/// The mask and the shot counter live in tensors so that `&self` forward
/// passes can update them in place and state dicts can round-trip them.
pub struct SparsityState {
    pub mask: Tensor,
    pub update_count: Tensor,
}

impl SparsityState {
    /// Fresh state for a weight of the given shape: an all-ones mask
    /// (nothing pruned yet) and a zero shot counter.
    pub fn new(weight_shape: &[usize]) -> Self {
        SparsityState {
            mask: Tensor::new(ArrayD::ones(IxDyn(weight_shape)), false),
            update_count: Tensor::new(ArrayD::zeros(IxDyn(&[])), false),
        }
    }

    /// Recomputes the mask from the current weight values.
    pub fn refresh(&self, weight: &Tensor, n: usize, m: usize) -> Result<(), String> {
        let mask = nm_sparsity_mask(&weight.lock().data, n, m)?;
        self.mask.lock().data = mask;
        Ok(())
    }

    /// Number of mask updates taken so far in shot-based modes.
    pub fn shots_taken(&self) -> usize {
        self.update_count
            .lock()
            .data
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0) as usize
    }

    fn record_shot(&self) {
        let taken = self.shots_taken();
        self.update_count.lock().data = ArrayD::from_elem(IxDyn(&[]), (taken + 1) as f32);
    }
}

/// Validates a layer's sparsity hyperparameters against its weight size.
///
/// Divisibility only matters when a mask will actually be computed, so
/// inference-mode layers accept any weight size.
pub(crate) fn check_group_size(weight_len: usize, hparams: &SparsityHParams) -> Result<(), String> {
    hparams.validate()?;
    if hparams.mode != SparsityMode::Inference {
        let (_, m) = hparams.weight_params.prune_rate;
        if weight_len % m != 0 {
            return Err(format!(
                "weight element count {} is not divisible by group size {}",
                weight_len, m
            ));
        }
    }
    Ok(())
}

/// Resolves the weight a sparsified layer should project with, applying the
/// mode policy and updating the mask state.
///
/// Mask computation failures are logged and fall back to the dense weight;
/// layer constructors validate the prune rate against the weight shape, so
/// a failure here means the weight was replaced with an incompatible shape.
pub(crate) fn effective_weight(
    weight: &Tensor,
    state: Option<&SparsityState>,
    hparams: &SparsityHParams,
) -> Tensor {
    let state = match state {
        Some(state) => state,
        None => return weight.clone(),
    };
    let (n, m) = hparams.weight_params.prune_rate;
    match hparams.mode {
        SparsityMode::Inference => weight.clone(),
        SparsityMode::Materialize | SparsityMode::Training => {
            if let Err(e) = state.refresh(weight, n, m) {
                log::error!("sparsity mask update failed: {}", e);
                return weight.clone();
            }
            apply_sparsity(weight, &state.mask)
        }
        SparsityMode::Oneshot | SparsityMode::Fewshot => {
            if state.shots_taken() < hparams.num_shots {
                if let Err(e) = state.refresh(weight, n, m) {
                    log::error!("sparsity mask update failed: {}", e);
                    return weight.clone();
                }
                state.record_shot();
            }
            apply_sparsity(weight, &state.mask)
        }
    }
}
