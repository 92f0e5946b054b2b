use crate::tensor::Tensor;
use ndarray::{ArrayD, Axis, IxDyn, SliceInfo, SliceInfoElem};
use std::any::Any;

// Helper: reduce `grad` to `target_shape` by summing over broadcasted axes.
fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.clone();
    }

    let mut res = grad.clone();
    let grad_ndim = res.ndim();
    let target_ndim = target_shape.len();
    // If grad has fewer dims than target, pad with ones on the left
    if grad_ndim < target_ndim {
        let mut new_shape = vec![1; target_ndim - grad_ndim];
        new_shape.extend_from_slice(res.shape());
        res = res
            .to_shape(IxDyn(&new_shape))
            .expect("Broadcast reshape failed")
            .to_owned();
    }

    let grad_ndim = res.ndim();
    let dim_diff = grad_ndim as isize - target_ndim as isize;
    // Sum over axes where the target dimension is 1 or the axis doesn't exist in the target
    for axis in (0..grad_ndim).rev() {
        let axis_idx = axis as isize;
        let target_dim = if axis_idx - dim_diff >= 0 {
            target_shape[(axis_idx - dim_diff) as usize]
        } else {
            1
        };
        if res.shape()[axis] != target_dim {
            res = res.sum_axis(Axis(axis));
        }
    }

    if res.shape() != target_shape {
        res = res
            .to_shape(IxDyn(target_shape))
            .expect("Final reshape to target shape failed")
            .to_owned();
    }
    res
}

// Helper: permute axes so that `axis` becomes the last axis.
fn permute_to_last(a: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let ndim = a.ndim();
    if axis == ndim - 1 {
        return (a.clone(), None);
    }
    let mut perm: Vec<usize> = (0..ndim).collect();
    let axis_val = perm.remove(axis);
    perm.push(axis_val);
    let permuted = a.view().permuted_axes(perm.clone()).to_owned();
    (permuted, Some(perm))
}

fn permute_back(a: ArrayD<f32>, perm: &[usize]) -> ArrayD<f32> {
    let ndim = perm.len();
    let mut inv = vec![0usize; ndim];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    a.view().permuted_axes(inv).to_owned()
}

pub trait Operation: Send + Sync {
    /// Performs the forward pass of the operation.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The input tensors.
    /// * `output` - A mutable reference to the output tensor's data.
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>);

    /// Performs the backward pass of the operation.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The input tensors.
    /// * `output_grad` - The gradient of the output tensor.
    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>>;

    /// Returns the operation as a `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

/// Reshape operation: changes tensor shape but keeps elements order
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: Vec<usize>) -> Self {
        Reshape { shape }
    }
}

impl Operation for Reshape {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let a_clone = a.clone();
        let s = a_clone
            .to_shape(self.shape.clone())
            .expect("Reshape forward: invalid shape");
        *output = s.to_owned().into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].lock().data.shape().to_vec();
        let og_clone = output_grad.clone();
        let g = og_clone
            .to_shape(IxDyn(&in_shape))
            .expect("Reshape backward: invalid shape");
        vec![g.to_owned()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Permute operation: reorders the axes of a tensor.
pub struct Permute {
    pub axes: Vec<usize>,
}

impl Permute {
    pub fn new(axes: Vec<usize>) -> Self {
        Permute { axes }
    }
}

impl Operation for Permute {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = a.view().permuted_axes(self.axes.clone()).to_owned();
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        // Apply the inverse permutation to route the gradient back
        vec![permute_back(output_grad.clone(), &self.axes)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sum operation: sums all elements to a scalar
pub struct Sum;

impl Operation for Sum {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let s = a.sum();
        *output = ArrayD::from_elem(IxDyn(&[]), s);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        // output_grad is scalar; expand to input shape
        let val = *output_grad
            .iter()
            .next()
            .expect("Expected scalar output_grad");
        let grad = ArrayD::from_elem(IxDyn(&a_shape), val);
        vec![grad]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mean operation: computes mean over all elements to a scalar
pub struct Mean;

impl Operation for Mean {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let mean = a.sum() / (a.len() as f32);
        *output = ArrayD::from_elem(IxDyn(&[]), mean);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let val = *output_grad
            .iter()
            .next()
            .expect("Expected scalar output_grad");
        let grad = ArrayD::from_elem(IxDyn(&a_shape), val / (inputs[0].lock().data.len() as f32));
        vec![grad]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The addition operation.
pub struct Add;

impl Operation for Add {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let b = &inputs[1].lock().data;
        *output = a + b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let b_shape = inputs[1].lock().data.shape().to_vec();
        let grad_a = reduce_grad_to_shape(output_grad, &a_shape);
        let grad_b = reduce_grad_to_shape(output_grad, &b_shape);
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The multiplication operation.
pub struct Mul;

impl Operation for Mul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let b = &inputs[1].lock().data;
        *output = a * b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = &inputs[0].lock().data;
        let b = &inputs[1].lock().data;
        let grad_a = (b * output_grad).to_owned();
        let grad_b = (a * output_grad).to_owned();
        let grad_a = reduce_grad_to_shape(&grad_a, a.shape());
        let grad_b = reduce_grad_to_shape(&grad_b, b.shape());
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The subtraction operation.
pub struct Sub;

impl Operation for Sub {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let b = &inputs[1].lock().data;
        *output = a - b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let b_shape = inputs[1].lock().data.shape().to_vec();
        let grad_a = reduce_grad_to_shape(output_grad, &a_shape);
        let grad_b = reduce_grad_to_shape(&(-output_grad), &b_shape);
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The power operation.
pub struct Pow(pub f32);

impl Operation for Pow {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = a.mapv(|x| x.powf(self.0));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = &inputs[0].lock().data;
        vec![output_grad * a.mapv(|x| self.0 * x.powf(self.0 - 1.0))]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The matrix multiplication operation (2D).
pub struct MatMul;

impl Operation for MatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix2>()
            .expect("MatMul forward: left operand must be 2D");
        let b = inputs[1]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix2>()
            .expect("MatMul forward: right operand must be 2D");
        *output = a.dot(&b).into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix2>()
            .expect("MatMul backward: left operand must be 2D");
        let b = inputs[1]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix2>()
            .expect("MatMul backward: right operand must be 2D");
        let g = output_grad
            .clone()
            .into_dimensionality::<ndarray::Ix2>()
            .expect("MatMul backward: output grad must be 2D");
        let grad_a = g.dot(&b.t()).into_dyn();
        let grad_b = a.t().dot(&g).into_dyn();
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Batched matrix multiplication over a leading batch axis: (B, M, K) x (B, K, N) -> (B, M, N).
pub struct BatchedMatMul;

impl Operation for BatchedMatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .expect("BatchedMatMul forward: left operand must be 3D");
        let b = inputs[1]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .expect("BatchedMatMul forward: right operand must be 3D");
        let (batch, m, _k) = a.dim();
        let n = b.dim().2;
        let mut out = ndarray::Array3::<f32>::zeros((batch, m, n));
        for i in 0..batch {
            let ai = a.index_axis(Axis(0), i);
            let bi = b.index_axis(Axis(0), i);
            out.index_axis_mut(Axis(0), i).assign(&ai.dot(&bi));
        }
        *output = out.into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .expect("BatchedMatMul backward: left operand must be 3D");
        let b = inputs[1]
            .lock()
            .data
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .expect("BatchedMatMul backward: right operand must be 3D");
        let g = output_grad
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .expect("BatchedMatMul backward: output grad must be 3D");
        let batch = a.dim().0;
        let mut grad_a = ndarray::Array3::<f32>::zeros(a.dim());
        let mut grad_b = ndarray::Array3::<f32>::zeros(b.dim());
        for i in 0..batch {
            let ai = a.index_axis(Axis(0), i);
            let bi = b.index_axis(Axis(0), i);
            let gi = g.index_axis(Axis(0), i);
            grad_a.index_axis_mut(Axis(0), i).assign(&gi.dot(&bi.t()));
            grad_b.index_axis_mut(Axis(0), i).assign(&ai.t().dot(&gi));
        }
        vec![grad_a.into_dyn(), grad_b.into_dyn()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Softmax along a given axis.
pub struct Softmax {
    pub axis: usize,
}

impl Softmax {
    pub fn new(axis: usize) -> Self {
        Softmax { axis }
    }
}

fn softmax_lanes(x: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let (mut out, perm_opt) = permute_to_last(x, axis);
    let last_axis = out.ndim() - 1;
    for mut lane in out.lanes_mut(Axis(last_axis)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
    (out, perm_opt)
}

impl Operation for Softmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = &inputs[0].lock().data;
        let axis = if self.axis >= x.ndim() {
            x.ndim() - 1
        } else {
            self.axis
        };
        let (out, perm_opt) = softmax_lanes(x, axis);
        if let Some(ref perm) = perm_opt {
            *output = permute_back(out, perm);
        } else {
            *output = out;
        }
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = &inputs[0].lock().data;
        let axis = if self.axis >= x.ndim() {
            x.ndim() - 1
        } else {
            self.axis
        };
        let (y, perm_opt) = softmax_lanes(x, axis);
        let last_axis = y.ndim() - 1;
        // grad = y * (grad_out - sum(grad_out * y))
        let (p_output_grad, _) = permute_to_last(output_grad, axis);
        let mut grad_in = p_output_grad.clone();
        for ((mut g_lane, y_lane), og_lane) in grad_in
            .lanes_mut(Axis(last_axis))
            .into_iter()
            .zip(y.lanes(Axis(last_axis)).into_iter())
            .zip(p_output_grad.lanes(Axis(last_axis)).into_iter())
        {
            let mut s = 0.0f32;
            for (og, &yy) in og_lane.iter().zip(y_lane.iter()) {
                s += og * yy;
            }
            for (gi, &yy) in g_lane.iter_mut().zip(y_lane.iter()) {
                *gi = yy * (*gi - s);
            }
        }
        if let Some(ref perm) = perm_opt {
            vec![permute_back(grad_in, perm)]
        } else {
            vec![grad_in]
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The stack operation.
pub struct Stack(pub usize);

impl Operation for Stack {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let axis = self.0;
        let mut arrays = Vec::new();
        for input in inputs {
            arrays.push(input.lock().data.clone());
        }
        *output = ndarray::stack(
            Axis(axis),
            &arrays.iter().map(|x| x.view()).collect::<Vec<_>>(),
        )
        .expect("Stack forward: mismatched input shapes");
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let axis = self.0;
        let mut grads = Vec::new();
        for (i, _input) in inputs.iter().enumerate() {
            let mut slice_info_elems: Vec<SliceInfoElem> = Vec::new();
            for j in 0..output_grad.ndim() {
                if j == axis {
                    slice_info_elems.push((i..i + 1).into());
                } else {
                    slice_info_elems.push((..).into());
                }
            }
            let slice_info: SliceInfo<_, IxDyn, IxDyn> =
                unsafe { SliceInfo::new(slice_info_elems).unwrap() };
            grads.push(
                output_grad
                    .slice(slice_info)
                    .to_owned()
                    .into_dyn()
                    .remove_axis(Axis(axis)),
            );
        }
        grads
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Slice operation: selects a contiguous range along a single axis.
pub struct Slice {
    pub axis: usize,
    pub start: usize,
    pub len: usize,
}

impl Slice {
    pub fn new(axis: usize, start: usize, len: usize) -> Self {
        Slice { axis, start, len }
    }

    fn slice_info(&self, ndim: usize) -> SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn> {
        let mut elems: Vec<SliceInfoElem> = Vec::new();
        for i in 0..ndim {
            if i == self.axis {
                elems.push((self.start..self.start + self.len).into());
            } else {
                elems.push((..).into());
            }
        }
        unsafe { SliceInfo::new(elems).unwrap() }
    }
}

impl Operation for Slice {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let info = self.slice_info(a.ndim());
        *output = a.slice(info).to_owned().into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        // place the output_grad back into the correct slice positions for the input shape
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let mut res = ArrayD::<f32>::zeros(IxDyn(&a_shape));
        let info = self.slice_info(a_shape.len());
        res.slice_mut(info).assign(output_grad);
        vec![res]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
