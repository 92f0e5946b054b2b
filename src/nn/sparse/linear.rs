//! Sparsified linear projection.

use crate::nn::sparse::hparams::{SparsityHParams, SparsityMode};
use crate::nn::sparse::mask::{check_group_size, effective_weight, SparsityState};
use crate::nn::{Linear, Module};
use crate::tensor::Tensor;
use std::any::Any;
use std::collections::HashMap;

/// A linear layer (without bias) whose weight is pruned with a structured
/// N:M mask according to the configured mode.
pub struct SparseLinear {
    pub inner: Linear,
    pub sparsity: SparsityHParams,
    state: Option<SparsityState>,
}

impl SparseLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        sparsity: SparsityHParams,
    ) -> Result<Self, String> {
        check_group_size(in_features * out_features, &sparsity)?;
        let inner = Linear::new(in_features, out_features, false);
        let state = (sparsity.mode != SparsityMode::Inference)
            .then(|| SparsityState::new(&[in_features, out_features]));
        Ok(SparseLinear {
            inner,
            sparsity,
            state,
        })
    }

    /// The current mask, if the layer carries one (never in inference mode).
    pub fn mask(&self) -> Option<Tensor> {
        self.state.as_ref().map(|s| s.mask.clone())
    }

    /// Mask updates taken so far in shot-based modes.
    pub fn mask_update_count(&self) -> usize {
        self.state.as_ref().map(|s| s.shots_taken()).unwrap_or(0)
    }

    /// Non-trainable state (mask and shot counter) for state dicts.
    pub fn named_state(&self, prefix: &str) -> Vec<(String, Tensor)> {
        match &self.state {
            Some(state) => vec![
                (
                    format!("{}.weight_sparsity_mask", prefix),
                    state.mask.clone(),
                ),
                (
                    format!("{}.mask_update_count", prefix),
                    state.update_count.clone(),
                ),
            ],
            None => vec![],
        }
    }
}

impl Module for SparseLinear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let weight = effective_weight(&self.inner.weight, self.state.as_ref(), &self.sparsity);
        self.inner.forward_with_weight(input, &weight)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.inner.parameters()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.inner.named_parameters(prefix)
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<(), String> {
        self.inner.load_state_dict(state, prefix)?;
        if let Some(own) = &self.state {
            if let Some(mask) = state.get(&format!("{}.weight_sparsity_mask", prefix)) {
                own.mask.lock().data = mask.lock().data.clone();
            }
            if let Some(count) = state.get(&format!("{}.mask_update_count", prefix)) {
                own.update_count.lock().data = count.lock().data.clone();
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
