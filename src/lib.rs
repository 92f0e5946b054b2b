//! This crate provides structured N:M sparsity for attention projection layers,
//! built on a small tensor library with automatic differentiation.
//!
//! The `nn` module holds the dense reference layers ([`nn::Linear`],
//! [`nn::AttentionProjection`], [`nn::CombinedQKVProjection`],
//! [`nn::MultiHeadAttention`]) and the sparsified variants under
//! [`nn::sparse`]. A sparsified layer in inference mode is numerically
//! identical to its dense counterpart; in the other modes it prunes its
//! weight with a structured N:M magnitude mask.

pub mod autograd;
pub mod io;
pub mod nn;
pub mod ops;
pub mod tensor;

#[cfg(feature = "safe_tensors")]
pub use io::safetensors_loader::load_safetensors_from_bytes;
