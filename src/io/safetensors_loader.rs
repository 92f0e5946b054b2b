use crate::tensor::Tensor;
use ndarray::{Array, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::collections::HashMap;

/// Parses a safetensors blob into a state dict of named tensors.
///
/// Only f32 tensors are supported. When `transpose_two_dim_weights` is set,
/// 2D tensors whose key ends in `.weight` are transposed from the common
/// `[out, in]` checkpoint layout to the `[in, out]` layout the layers here
/// use.
pub fn load_safetensors_from_bytes(
    bytes: &[u8],
    transpose_two_dim_weights: bool,
) -> Result<HashMap<String, Tensor>, String> {
    let st = SafeTensors::deserialize(bytes)
        .map_err(|e| format!("safetensors deserialize error: {}", e))?;
    let mut map: HashMap<String, Tensor> = HashMap::new();
    for (key, tensor) in st.tensors() {
        match tensor.dtype() {
            Dtype::F32 => {
                let shape: Vec<usize> = tensor.shape().to_vec();
                let raw = tensor.data();
                let mut data = Vec::with_capacity(raw.len() / 4);
                for chunk in raw.chunks_exact(4) {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(chunk);
                    data.push(f32::from_le_bytes(b));
                }
                let arr = Array::from_shape_vec(IxDyn(&shape), data)
                    .map_err(|e| format!("ndarray shape creation error: {}", e))?;
                let out =
                    if transpose_two_dim_weights && shape.len() == 2 && key.ends_with(".weight") {
                        let mat = arr
                            .into_dimensionality::<ndarray::Ix2>()
                            .map_err(|e| format!("transpose dim error: {}", e))?
                            .reversed_axes()
                            .as_standard_layout()
                            .to_owned();
                        Tensor::new(mat.into_dyn(), false)
                    } else {
                        Tensor::new(arr, false)
                    };
                map.insert(key.clone(), out);
            }
            other => {
                return Err(format!(
                    "unsupported dtype {:?} for tensor '{}': only F32 is supported",
                    other, key
                ));
            }
        }
    }
    Ok(map)
}
