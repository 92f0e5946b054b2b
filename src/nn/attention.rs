//! Dense attention projection layers.
//!
//! These are the reference layers the sparsified variants in [`super::sparse`]
//! wrap. A projection maps between the model dimension and the per-head
//! representation of a multi-head attention block; the fused variant computes
//! query, key and value with a single stacked weight.

use crate::nn::{xavier_uniform, Module};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use std::any::Any;
use std::collections::HashMap;

/// Configuration for [`AttentionProjection`].
#[derive(Debug, Clone)]
pub struct AttentionProjectionConfig {
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    /// Projects per-head representations back to the model dimension when set;
    /// otherwise projects the model dimension out to heads.
    pub is_output_projection: bool,
    pub use_bias: bool,
    /// Store the output-projection weight as `[heads, dim_per_head, model]`
    /// instead of `[model, heads, dim_per_head]`.
    pub use_nhd_shape: bool,
    /// Fuse the `heads` and `dim_per_head` axes into one weight axis.
    pub attention_combine_dims: bool,
}

impl AttentionProjectionConfig {
    pub fn new(input_dim: usize, num_heads: usize, dim_per_head: usize) -> Self {
        AttentionProjectionConfig {
            input_dim,
            num_heads,
            dim_per_head,
            is_output_projection: false,
            use_bias: true,
            use_nhd_shape: false,
            attention_combine_dims: false,
        }
    }

    pub(crate) fn weight_shape(&self) -> Vec<usize> {
        let (d, n, h) = (self.input_dim, self.num_heads, self.dim_per_head);
        if self.attention_combine_dims {
            if self.is_output_projection && self.use_nhd_shape {
                vec![n * h, d]
            } else {
                vec![d, n * h]
            }
        } else if self.is_output_projection && self.use_nhd_shape {
            vec![n, h, d]
        } else {
            vec![d, n, h]
        }
    }

    fn bias_shape(&self) -> Vec<usize> {
        let (d, n, h) = (self.input_dim, self.num_heads, self.dim_per_head);
        if self.is_output_projection {
            vec![d]
        } else if self.attention_combine_dims {
            vec![n * h]
        } else {
            vec![n, h]
        }
    }
}

/// A single attention projection layer.
///
/// Input projections map `[..., input_dim]` to `[..., num_heads, dim_per_head]`;
/// output projections map `[..., num_heads, dim_per_head]` back to
/// `[..., input_dim]`.
pub struct AttentionProjection {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub is_output_projection: bool,
    pub use_nhd_shape: bool,
    pub attention_combine_dims: bool,
}

impl AttentionProjection {
    pub fn new(config: &AttentionProjectionConfig) -> Self {
        let (d, n, h) = (config.input_dim, config.num_heads, config.dim_per_head);
        let (fan_in, fan_out) = if config.is_output_projection {
            (n * h, d)
        } else {
            (d, n * h)
        };
        let weight = Tensor::new(
            xavier_uniform(&config.weight_shape(), fan_in, fan_out),
            true,
        );
        let bias = config
            .use_bias
            .then(|| Tensor::new(ArrayD::zeros(IxDyn(&config.bias_shape())), true));
        AttentionProjection {
            weight,
            bias,
            input_dim: d,
            num_heads: n,
            dim_per_head: h,
            is_output_projection: config.is_output_projection,
            use_nhd_shape: config.use_nhd_shape,
            attention_combine_dims: config.attention_combine_dims,
        }
    }

    /// Runs the projection with an explicit weight tensor.
    ///
    /// Sparsified wrappers use this seam to inject a masked effective weight
    /// while reusing the dense shape handling.
    pub fn forward_with_weight(&self, input: &Tensor, weight: &Tensor) -> Tensor {
        let input_shape = input.lock().data.shape().to_vec();
        let ndim = input_shape.len();
        let (d, n, h) = (self.input_dim, self.num_heads, self.dim_per_head);

        if self.is_output_projection {
            if ndim < 2 || input_shape[ndim - 2] != n || input_shape[ndim - 1] != h {
                log::error!(
                    "AttentionProjection output forward: expected input [..., {}, {}], got {:?}",
                    n,
                    h,
                    input_shape
                );
                return input.clone();
            }
            let batch = input_shape[..ndim - 2].iter().product::<usize>();
            let x2 = match input.reshape(vec![batch, n * h]) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("AttentionProjection output forward: flatten input failed: {}", e);
                    return input.clone();
                }
            };
            // Bring the weight to [n*h, d] regardless of its storage layout.
            let w2 = match (self.attention_combine_dims, self.use_nhd_shape) {
                (true, true) => weight.clone(),
                (true, false) => weight.permute(vec![1, 0]),
                (false, true) => match weight.reshape(vec![n * h, d]) {
                    Ok(t) => t,
                    Err(e) => {
                        log::error!("AttentionProjection output forward: reshape weight failed: {}", e);
                        return input.clone();
                    }
                },
                (false, false) => match weight.permute(vec![1, 2, 0]).reshape(vec![n * h, d]) {
                    Ok(t) => t,
                    Err(e) => {
                        log::error!("AttentionProjection output forward: reshape weight failed: {}", e);
                        return input.clone();
                    }
                },
            };
            let mut y2 = x2.matmul(&w2);
            if let Some(bias) = &self.bias {
                y2 = y2.add(bias);
            }
            let mut out_shape = input_shape[..ndim - 2].to_vec();
            out_shape.push(d);
            match y2.reshape(out_shape) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("AttentionProjection output forward: reshape output failed: {}", e);
                    input.clone()
                }
            }
        } else {
            if ndim < 1 || input_shape[ndim - 1] != d {
                log::error!(
                    "AttentionProjection input forward: expected input [..., {}], got {:?}",
                    d,
                    input_shape
                );
                return input.clone();
            }
            let batch = input_shape[..ndim - 1].iter().product::<usize>();
            let x2 = match input.reshape(vec![batch, d]) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("AttentionProjection input forward: flatten input failed: {}", e);
                    return input.clone();
                }
            };
            let w2 = if self.attention_combine_dims {
                weight.clone()
            } else {
                match weight.reshape(vec![d, n * h]) {
                    Ok(t) => t,
                    Err(e) => {
                        log::error!("AttentionProjection input forward: reshape weight failed: {}", e);
                        return input.clone();
                    }
                }
            };
            let mut y2 = x2.matmul(&w2);
            if self.attention_combine_dims {
                if let Some(bias) = &self.bias {
                    y2 = y2.add(bias);
                }
            }
            let mut out_shape = input_shape[..ndim - 1].to_vec();
            out_shape.push(n);
            out_shape.push(h);
            let mut y = match y2.reshape(out_shape) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("AttentionProjection input forward: reshape output failed: {}", e);
                    return input.clone();
                }
            };
            if !self.attention_combine_dims {
                if let Some(bias) = &self.bias {
                    y = y.add(bias);
                }
            }
            y
        }
    }
}

impl Module for AttentionProjection {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward_with_weight(input, &self.weight)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), b.clone()));
        }
        out
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<(), String> {
        let key_w = format!("{}.weight", prefix);
        if let Some(w) = state.get(&key_w) {
            self.weight = w.clone();
        }
        let key_b = format!("{}.bias", prefix);
        if let Some(b) = state.get(&key_b) {
            self.bias = Some(b.clone());
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

/// Configuration for [`CombinedQKVProjection`].
#[derive(Debug, Clone)]
pub struct CombinedQKVProjectionConfig {
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub use_bias: bool,
    /// Fuse the `heads` and `dim_per_head` axes into one weight axis.
    pub attention_combine_dims: bool,
}

impl CombinedQKVProjectionConfig {
    pub fn new(input_dim: usize, num_heads: usize, dim_per_head: usize) -> Self {
        CombinedQKVProjectionConfig {
            input_dim,
            num_heads,
            dim_per_head,
            use_bias: true,
            attention_combine_dims: false,
        }
    }

    pub(crate) fn weight_shape(&self) -> Vec<usize> {
        let (d, n, h) = (self.input_dim, self.num_heads, self.dim_per_head);
        if self.attention_combine_dims {
            vec![3, d, n * h]
        } else {
            vec![3, d, n, h]
        }
    }

    fn bias_shape(&self) -> Vec<usize> {
        let (n, h) = (self.num_heads, self.dim_per_head);
        if self.attention_combine_dims {
            vec![3, n * h]
        } else {
            vec![3, n, h]
        }
    }
}

/// A fused query/key/value projection layer.
///
/// The three projection weights are stacked along a leading axis of size 3,
/// so one weight tensor (and one sparsity mask) covers all of q, k and v.
pub struct CombinedQKVProjection {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub attention_combine_dims: bool,
}

impl CombinedQKVProjection {
    pub fn new(config: &CombinedQKVProjectionConfig) -> Self {
        let (d, n, h) = (config.input_dim, config.num_heads, config.dim_per_head);
        let weight = Tensor::new(xavier_uniform(&config.weight_shape(), d, n * h), true);
        let bias = config
            .use_bias
            .then(|| Tensor::new(ArrayD::zeros(IxDyn(&config.bias_shape())), true));
        CombinedQKVProjection {
            weight,
            bias,
            input_dim: d,
            num_heads: n,
            dim_per_head: h,
            attention_combine_dims: config.attention_combine_dims,
        }
    }

    /// Projects the input to (query, key, value), each `[..., num_heads, dim_per_head]`.
    pub fn forward_qkv(&self, input: &Tensor) -> (Tensor, Tensor, Tensor) {
        self.forward_qkv_with_weight(input, &self.weight)
    }

    /// Runs the fused projection with an explicit stacked weight tensor.
    pub fn forward_qkv_with_weight(
        &self,
        input: &Tensor,
        weight: &Tensor,
    ) -> (Tensor, Tensor, Tensor) {
        let input_shape = input.lock().data.shape().to_vec();
        let ndim = input_shape.len();
        let (d, n, h) = (self.input_dim, self.num_heads, self.dim_per_head);
        if ndim < 1 || input_shape[ndim - 1] != d {
            log::error!(
                "CombinedQKVProjection forward: expected input [..., {}], got {:?}",
                d,
                input_shape
            );
            return (input.clone(), input.clone(), input.clone());
        }
        let batch = input_shape[..ndim - 1].iter().product::<usize>();
        let x2 = match input.reshape(vec![batch, d]) {
            Ok(t) => t,
            Err(e) => {
                log::error!("CombinedQKVProjection forward: flatten input failed: {}", e);
                return (input.clone(), input.clone(), input.clone());
            }
        };
        let mut outs = Vec::with_capacity(3);
        for k in 0..3 {
            // Differentiable slice keeps the fused weight a single trainable leaf.
            let wk = match weight.slice(0, k, 1).reshape(vec![d, n * h]) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("CombinedQKVProjection forward: reshape weight slice failed: {}", e);
                    return (input.clone(), input.clone(), input.clone());
                }
            };
            let mut yk = x2.matmul(&wk);
            if let Some(bias) = &self.bias {
                match bias.slice(0, k, 1).reshape(vec![n * h]) {
                    Ok(bk) => yk = yk.add(&bk),
                    Err(e) => {
                        log::error!("CombinedQKVProjection forward: reshape bias slice failed: {}", e);
                        return (input.clone(), input.clone(), input.clone());
                    }
                }
            }
            let mut out_shape = input_shape[..ndim - 1].to_vec();
            out_shape.push(n);
            out_shape.push(h);
            match yk.reshape(out_shape) {
                Ok(t) => outs.push(t),
                Err(e) => {
                    log::error!("CombinedQKVProjection forward: reshape output failed: {}", e);
                    return (input.clone(), input.clone(), input.clone());
                }
            }
        }
        let v = outs.pop().unwrap();
        let k = outs.pop().unwrap();
        let q = outs.pop().unwrap();
        (q, k, v)
    }
}

impl Module for CombinedQKVProjection {
    /// Stacks the three projections along a new leading axis: `[3, ..., n, h]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let (q, k, v) = self.forward_qkv(input);
        Tensor::stack(&[q, k, v], 0)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), b.clone()));
        }
        out
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<(), String> {
        let key_w = format!("{}.weight", prefix);
        if let Some(w) = state.get(&key_w) {
            self.weight = w.clone();
        }
        let key_b = format!("{}.bias", prefix);
        if let Some(b) = state.get(&key_b) {
            self.bias = Some(b.clone());
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

/// Multi-head attention built from a fused QKV projection and an output projection.
pub struct MultiHeadAttention {
    pub qkv: CombinedQKVProjection,
    pub out_proj: AttentionProjection,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
}

impl MultiHeadAttention {
    pub fn new(input_dim: usize, num_heads: usize, dim_per_head: usize) -> Self {
        let qkv = CombinedQKVProjection::new(&CombinedQKVProjectionConfig::new(
            input_dim,
            num_heads,
            dim_per_head,
        ));
        let mut out_cfg = AttentionProjectionConfig::new(input_dim, num_heads, dim_per_head);
        out_cfg.is_output_projection = true;
        let out_proj = AttentionProjection::new(&out_cfg);
        MultiHeadAttention {
            qkv,
            out_proj,
            input_dim,
            num_heads,
            dim_per_head,
        }
    }

    pub fn forward_impl(&self, x: &Tensor) -> Tensor {
        let shape = x.lock().data.shape().to_vec();
        if shape.len() != 3 {
            log::error!("MultiHeadAttention forward: expected 3D input, got {:?}", shape);
            return x.clone();
        }
        let (b, seq) = (shape[0], shape[1]);
        let (n, h) = (self.num_heads, self.dim_per_head);

        let (q, k, v) = self.qkv.forward_qkv(x);
        let to_heads = |t: &Tensor| -> Result<Tensor, String> {
            t.permute(vec![0, 2, 1, 3]).reshape(vec![b * n, seq, h])
        };
        let (q3, k3, v3) = match (to_heads(&q), to_heads(&k), to_heads(&v)) {
            (Ok(q3), Ok(k3), Ok(v3)) => (q3, k3, v3),
            _ => {
                log::error!("MultiHeadAttention forward: reshape to per-head batches failed");
                return x.clone();
            }
        };

        let scale = 1.0f32 / (h as f32).sqrt();
        let scores = q3.batched_matmul(&k3.permute(vec![0, 2, 1])).scale(scale);
        let attn = scores.softmax(2);
        let ctx = attn.batched_matmul(&v3);

        let ctx = match ctx.reshape(vec![b, n, seq, h]) {
            Ok(t) => t.permute(vec![0, 2, 1, 3]),
            Err(e) => {
                log::error!("MultiHeadAttention forward: reshape context failed: {}", e);
                return x.clone();
            }
        };
        self.out_proj.forward(&ctx)
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward_impl(input)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.qkv.parameters();
        params.extend(self.out_proj.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self.qkv.named_parameters(&format!("{}.qkv", prefix));
        out.extend(
            self.out_proj
                .named_parameters(&format!("{}.out_proj", prefix)),
        );
        out
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<(), String> {
        self.qkv.load_state_dict(state, &format!("{}.qkv", prefix))?;
        self.out_proj
            .load_state_dict(state, &format!("{}.out_proj", prefix))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
