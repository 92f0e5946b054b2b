use crate::ops::{
    Add, BatchedMatMul, MatMul, Mean, Mul, Operation, Permute, Pow, Reshape, Slice, Softmax,
    Stack, Sub, Sum,
};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// `TensorData` contains the actual data of a tensor, along with metadata for automatic differentiation.
pub struct TensorData {
    /// The tensor's data, stored as a dynamically-dimensioned array.
    pub data: ArrayD<f32>,
    /// The gradient of the tensor, if it has one.
    pub grad: Option<ArrayD<f32>>,
    /// The operation that created this tensor, if any.
    pub creator: Option<Arc<dyn Operation + Send + Sync>>,
    /// The input tensors that were used to create this tensor.
    pub inputs: Vec<Tensor>,
    /// Whether this tensor requires a gradient.
    pub requires_grad: bool,
}

/// A multi-dimensional array (tensor) that supports automatic differentiation.
///
/// Tensors are the fundamental data structure in `sparse_engine`. They can be created from scratch
/// or as the result of operations on other tensors. If a tensor is created from operations on other
/// tensors that have `requires_grad = true`, then it will also have `requires_grad = true` and will
/// be part of a computation graph.
#[derive(Clone)]
pub struct Tensor(Arc<Mutex<TensorData>>);

impl Tensor {
    /// Creates a new tensor.
    ///
    /// # Arguments
    ///
    /// * `data` - The tensor's data.
    /// * `requires_grad` - Whether this tensor should have a gradient.
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: None,
            inputs: vec![],
            requires_grad,
        })))
    }

    /// Applies an operation to a set of input tensors.
    ///
    /// This is the primary way that computation graphs are constructed.
    ///
    /// # Arguments
    ///
    /// * `op` - The operation to apply.
    /// * `inputs` - The input tensors.
    pub fn apply(op: Arc<dyn Operation + Send + Sync>, inputs: &[Tensor]) -> Tensor {
        let requires_grad = inputs.iter().any(|t| t.lock().requires_grad);
        // Every op assigns its full output array, so the preallocated shape only
        // has to be valid; the first input's shape is a safe default.
        let out_shape = inputs[0].lock().data.shape().to_vec();
        let mut data = ArrayD::zeros(IxDyn(&out_shape));
        op.forward(inputs, &mut data);

        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: Some(op),
            inputs: inputs.to_vec(),
            requires_grad,
        })))
    }

    /// Adds two tensors.
    pub fn add(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Add), &[self.clone(), other.clone()])
    }

    /// Multiplies two tensors element-wise.
    pub fn mul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Mul), &[self.clone(), other.clone()])
    }

    /// Subtracts two tensors.
    pub fn sub(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Sub), &[self.clone(), other.clone()])
    }

    /// Performs 2D matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(MatMul), &[self.clone(), other.clone()])
    }

    /// Performs batched matrix multiplication over a leading batch axis.
    pub fn batched_matmul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(BatchedMatMul), &[self.clone(), other.clone()])
    }

    /// Raises a tensor to a power.
    pub fn pow(&self, power: f32) -> Tensor {
        Tensor::apply(Arc::new(Pow(power)), &[self.clone()])
    }

    /// Multiplies the tensor by a scalar.
    pub fn scale(&self, factor: f32) -> Tensor {
        let scalar = Tensor::new(ArrayD::from_elem(IxDyn(&[1]), factor), false);
        Tensor::apply(Arc::new(Mul), &[self.clone(), scalar])
    }

    /// Computes the sum of the tensor's elements.
    pub fn sum(&self) -> Tensor {
        Tensor::apply(Arc::new(Sum), &[self.clone()])
    }

    /// Computes the mean of the tensor's elements.
    pub fn mean(&self) -> Tensor {
        Tensor::apply(Arc::new(Mean), &[self.clone()])
    }

    /// Element-wise softmax along the specified axis.
    pub fn softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Softmax::new(axis)), &[self.clone()])
    }

    /// Reshapes the tensor.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor, String> {
        // Validate target shape first to produce same error semantics
        let lock = self.lock();
        let data_clone = lock.data.clone();
        drop(lock);
        match data_clone.to_shape(shape.clone()) {
            Ok(_) => Ok(Tensor::apply(
                Arc::new(Reshape::new(shape)),
                &[self.clone()],
            )),
            Err(e) => Err(format!(
                "Cannot reshape tensor from {:?} to {:?}: {}",
                data_clone.shape(),
                shape,
                e
            )),
        }
    }

    /// Reorders the tensor's axes.
    pub fn permute(&self, axes: Vec<usize>) -> Tensor {
        Tensor::apply(Arc::new(Permute::new(axes)), &[self.clone()])
    }

    /// Selects a contiguous range along a single axis.
    pub fn slice(&self, axis: usize, start: usize, len: usize) -> Tensor {
        Tensor::apply(Arc::new(Slice::new(axis, start, len)), &[self.clone()])
    }

    /// Stacks a list of tensors along a new axis.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Stack(axis)), tensors)
    }

    /// Locks the tensor's data for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, TensorData> {
        self.0.lock().unwrap()
    }

    /// Sets the gradient of this tensor to zero.
    pub fn zero_grad(&self) {
        let mut lock = self.lock();
        lock.grad = None;
    }

    /// Detaches the tensor from the computation graph.
    pub fn detach(&self) -> Tensor {
        let lock = self.lock();
        Tensor::new(lock.data.clone(), false)
    }

    /// Returns whether this tensor requires gradients.
    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    /// Sets whether this tensor requires gradients.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        let mut lock = self.lock();
        lock.requires_grad = requires_grad;
    }

    /// Performs backpropagation starting from this tensor.
    ///
    /// This will compute the gradients of all tensors in the computation graph that have
    /// `requires_grad = true`.
    pub fn backward(&self) {
        // Set gradient for the output tensor if not already set (root call)
        {
            let mut self_lock = self.lock();
            if self_lock.grad.is_none() {
                self_lock.grad = Some(ArrayD::ones(self_lock.data.dim()));
            }
        }

        // Walk the graph in reverse topological order so every node propagates
        // to its inputs exactly once, after its own gradient is complete. A
        // tensor feeding several downstream ops would otherwise have partial
        // gradients pushed through it repeatedly.
        let mut visited: HashSet<*const Mutex<TensorData>> = HashSet::new();
        let mut order: Vec<Tensor> = Vec::new();
        self.collect_topo(&mut visited, &mut order);

        for node in order.into_iter().rev() {
            let (creator, inputs, output_grad) = {
                let lock = node.lock();
                let creator = match &lock.creator {
                    Some(creator) => creator.clone(),
                    None => continue,
                };
                let grad = match &lock.grad {
                    Some(grad) => grad.clone(),
                    None => continue,
                };
                (creator, lock.inputs.clone(), grad)
            };
            let input_grads = creator.backward(&inputs, &output_grad);
            for (input, grad) in inputs.iter().zip(input_grads.into_iter()) {
                let mut lock = input.lock();
                if !lock.requires_grad {
                    continue;
                }
                match &mut lock.grad {
                    Some(existing) => *existing = &*existing + &grad,
                    None => lock.grad = Some(grad),
                }
            }
        }
    }

    fn collect_topo(
        &self,
        visited: &mut HashSet<*const Mutex<TensorData>>,
        order: &mut Vec<Tensor>,
    ) {
        if !visited.insert(Arc::as_ptr(&self.0)) {
            return;
        }
        let inputs = self.lock().inputs.clone();
        for input in &inputs {
            input.collect_topo(visited, order);
        }
        order.push(self.clone());
    }
}
