use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use std::any::Any;
use std::collections::HashMap;

pub mod attention;
pub use attention::{
    AttentionProjection, AttentionProjectionConfig, CombinedQKVProjection,
    CombinedQKVProjectionConfig, MultiHeadAttention,
};
pub mod sparse;

#[cfg(test)]
mod tests;

/// A trait for neural network modules.
pub trait Module: 'static + Any {
    /// Performs a forward pass through the module.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Returns the trainable parameters of the module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Default: return a vector of (name, Tensor) pairs for module parameters
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out: Vec<(String, Tensor)> = Vec::new();
        let params = self.parameters();
        for (i, p) in params.into_iter().enumerate() {
            out.push((format!("{}param{}", prefix, i), p));
        }
        out
    }

    /// Load a state dict into this module.
    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<(), String> {
        // Default implementation: apply any matching entries in the state dict to the
        // module's named parameters. This works because `named_parameters()` returns
        // `Tensor` instances referencing the same underlying storage as the module's
        // parameters, so mutating the storage will update the module in-place.
        for (name, param) in self.named_parameters(prefix) {
            if let Some(src) = state.get(&name) {
                let mut param_lock = param.lock();
                let src_lock = src.lock();
                if param_lock.data.shape() != src_lock.data.shape() {
                    return Err(format!(
                        "Shape mismatch for parameter '{}': module shape={:?}, state shape={:?}",
                        name,
                        param_lock.data.shape(),
                        src_lock.data.shape()
                    ));
                }
                param_lock.data = src_lock.data.clone();
            }
        }
        Ok(())
    }

    /// Allow downcasting from a `dyn Module` by providing an `Any` accessor.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Xavier-uniform initialization for a weight of the given shape.
pub(crate) fn xavier_uniform(shape: &[usize], fan_in: usize, fan_out: usize) -> ArrayD<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let mut rng = rand::thread_rng();
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-limit..limit))
}

/// A linear (fully connected) layer.
#[derive(Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Creates a new linear layer.
    ///
    /// # Arguments
    ///
    /// * `in_features` - The number of input features.
    /// * `out_features` - The number of output features.
    /// * `bias` - Whether to include a bias term.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        let weight_data = xavier_uniform(&[in_features, out_features], in_features, out_features);
        let weight = Tensor::new(weight_data, true);

        let bias = if bias {
            let bias_data = ArrayD::zeros(IxDyn(&[out_features]));
            Some(Tensor::new(bias_data, true))
        } else {
            None
        };

        Linear { weight, bias }
    }

    /// Projects the last input dimension with an explicit weight tensor.
    ///
    /// Sparsified wrappers use this seam to inject a masked effective weight
    /// while reusing the dense shape handling.
    pub fn forward_with_weight(&self, input: &Tensor, weight: &Tensor) -> Tensor {
        let input_shape = input.lock().data.shape().to_vec();
        let ndim = input_shape.len();
        let output = if ndim == 2 {
            input.matmul(weight)
        } else {
            // Collapse leading dims to 2D [batch, features]
            let last = input_shape[ndim - 1];
            let batch = input_shape[..ndim - 1].iter().product::<usize>();
            let reshaped = input.reshape(vec![batch, last]).unwrap();
            let out2 = reshaped.matmul(weight);
            let mut out_shape = input_shape.clone();
            out_shape[ndim - 1] = weight.lock().data.shape()[1];
            out2.reshape(out_shape).unwrap()
        };
        if let Some(bias) = &self.bias {
            output.add(bias)
        } else {
            output
        }
    }
}

impl Module for Linear {
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

/// Mean squared error loss.
pub struct MSELoss;

impl MSELoss {
    pub fn new() -> Self {
        MSELoss
    }

    pub fn forward(&self, pred: &Tensor, target: &Tensor) -> Tensor {
        pred.sub(target).pow(2.0).mean()
    }
}

impl Default for MSELoss {
    fn default() -> Self {
        Self::new()
    }
}

/// A trait for optimizers.
pub trait Optimizer {
    /// Updates the parameters from their accumulated gradients.
    fn step(&mut self, params: &[Tensor]);

    /// Clears the gradients of all parameters.
    fn zero_grad(&self, params: &[Tensor]) {
        for p in params {
            p.zero_grad();
        }
    }
}

/// Stochastic gradient descent with optional momentum.
pub struct SGD {
    pub lr: f32,
    pub momentum: f32,
    velocities: Vec<ArrayD<f32>>,
}

impl SGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        SGD {
            lr,
            momentum,
            velocities: Vec::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &[Tensor]) {
        if self.velocities.len() != params.len() {
            self.velocities = params
                .iter()
                .map(|p| ArrayD::zeros(p.lock().data.dim()))
                .collect();
        }
        for (i, param) in params.iter().enumerate() {
            let mut lock = param.lock();
            let grad = match &lock.grad {
                Some(g) => g.clone(),
                None => continue,
            };
            let update = if self.momentum > 0.0 {
                let v = &mut self.velocities[i];
                *v = &*v * self.momentum + &grad;
                v.clone()
            } else {
                grad
            };
            lock.data = &lock.data - &(update * self.lr);
        }
    }
}
