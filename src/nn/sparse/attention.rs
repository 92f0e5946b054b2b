//! Sparsified attention projection layers.
//!
//! Each layer wraps its dense counterpart from [`crate::nn::attention`] and
//! injects a masked effective weight through the dense layer's
//! `forward_with_weight` seam. The mask covers the whole weight tensor, so
//! for the fused QKV projection one mask spans query, key and value.

use crate::nn::attention::{
    AttentionProjection, AttentionProjectionConfig, CombinedQKVProjection,
    CombinedQKVProjectionConfig,
};
use crate::nn::sparse::hparams::{SparsityHParams, SparsityMode};
use crate::nn::sparse::mask::{check_group_size, effective_weight, SparsityState};
use crate::nn::Module;
use crate::tensor::Tensor;
use std::any::Any;
use std::collections::HashMap;

/// An [`AttentionProjection`] whose weight is pruned with a structured N:M
/// mask according to the configured mode.
pub struct SparseAttentionProjection {
    pub inner: AttentionProjection,
    pub sparsity: SparsityHParams,
    state: Option<SparsityState>,
}

impl SparseAttentionProjection {
    pub fn new(
        config: &AttentionProjectionConfig,
        sparsity: SparsityHParams,
    ) -> Result<Self, String> {
        let weight_shape = config.weight_shape();
        check_group_size(weight_shape.iter().product(), &sparsity)?;
        let inner = AttentionProjection::new(config);
        let state =
            (sparsity.mode != SparsityMode::Inference).then(|| SparsityState::new(&weight_shape));
        Ok(SparseAttentionProjection {
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

impl Module for SparseAttentionProjection {
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

/// A [`CombinedQKVProjection`] whose stacked weight is pruned with a
/// structured N:M mask according to the configured mode.
pub struct SparseCombinedQKVProjection {
    pub inner: CombinedQKVProjection,
    pub sparsity: SparsityHParams,
    state: Option<SparsityState>,
}

impl SparseCombinedQKVProjection {
    pub fn new(
        config: &CombinedQKVProjectionConfig,
        sparsity: SparsityHParams,
    ) -> Result<Self, String> {
        let weight_shape = config.weight_shape();
        check_group_size(weight_shape.iter().product(), &sparsity)?;
        let inner = CombinedQKVProjection::new(config);
        let state =
            (sparsity.mode != SparsityMode::Inference).then(|| SparsityState::new(&weight_shape));
        Ok(SparseCombinedQKVProjection {
            inner,
            sparsity,
            state,
        })
    }

    /// Projects the input to (query, key, value) with the mode policy applied.
    pub fn forward_qkv(&self, input: &Tensor) -> (Tensor, Tensor, Tensor) {
        let weight = effective_weight(&self.inner.weight, self.state.as_ref(), &self.sparsity);
        self.inner.forward_qkv_with_weight(input, &weight)
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

impl Module for SparseCombinedQKVProjection {
    /// Stacks the three projections along a new leading axis: `[3, ..., n, h]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let (q, k, v) = self.forward_qkv(input);
        Tensor::stack(&[q, k, v], 0)
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
