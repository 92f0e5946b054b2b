//! Hyperparameters controlling weight sparsification.

/// When and how often the sparsity mask is (re)computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparsityMode {
    /// No sparsification; the dense weight is used untouched.
    Inference,
    /// The mask is recomputed from the current weight on every forward pass
    /// and the pruned weight is materialized for the projection.
    Materialize,
    /// The mask is computed once, on the first forward pass, then frozen.
    Oneshot,
    /// The mask is recomputed for the first `num_shots` forward passes,
    /// then frozen.
    Fewshot,
    /// The mask is recomputed on every forward pass; gradients flow to the
    /// weight through the mask product.
    Training,
}

/// The kind of sparsity pattern applied to a weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparsityType {
    /// Per-element magnitude pruning without structure. Declared for
    /// completeness; layers reject it at construction.
    Unstructured,
    /// Keep the N largest-magnitude elements out of every group of M.
    StructuredNM,
}

/// Per-weight sparsification parameters.
#[derive(Debug, Clone, Copy)]
pub struct WeightSparsityParams {
    /// `(n, m)`: keep `n` elements out of every group of `m`.
    pub prune_rate: (usize, usize),
}

/// The full sparsity policy attached to a layer.
#[derive(Debug, Clone, Copy)]
pub struct SparsityHParams {
    pub sparsity_type: SparsityType,
    pub weight_params: WeightSparsityParams,
    pub mode: SparsityMode,
    /// Number of mask updates performed in [`SparsityMode::Fewshot`]
    /// (and [`SparsityMode::Oneshot`], where it is 1).
    pub num_shots: usize,
}

impl SparsityHParams {
    /// Structured N:M sparsity with the given prune rate and mode.
    pub fn structured_nm(n: usize, m: usize, mode: SparsityMode) -> Self {
        let num_shots = if mode == SparsityMode::Oneshot { 1 } else { 0 };
        SparsityHParams {
            sparsity_type: SparsityType::StructuredNM,
            weight_params: WeightSparsityParams { prune_rate: (n, m) },
            mode,
            num_shots,
        }
    }

    /// Like [`SparsityHParams::structured_nm`] with a shot budget for
    /// [`SparsityMode::Fewshot`].
    pub fn with_num_shots(mut self, num_shots: usize) -> Self {
        self.num_shots = num_shots;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.sparsity_type {
            SparsityType::Unstructured => {
                return Err("unstructured sparsity is not currently supported".to_string());
            }
            SparsityType::StructuredNM => {
                let (n, m) = self.weight_params.prune_rate;
                if m == 0 {
                    return Err("prune rate group size m must be positive".to_string());
                }
                if n == 0 {
                    return Err("prune rate n must be positive".to_string());
                }
                if n > m {
                    return Err(format!(
                        "prune rate ({}, {}) keeps more elements than the group holds",
                        n, m
                    ));
                }
            }
        }
        if matches!(self.mode, SparsityMode::Oneshot | SparsityMode::Fewshot)
            && self.num_shots == 0
        {
            return Err("shot-based modes need num_shots >= 1".to_string());
        }
        Ok(())
    }
}
