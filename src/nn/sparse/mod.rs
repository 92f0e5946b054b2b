//! Structured N:M sparsity for projection layers.
//!
//! A sparsified layer wraps its dense counterpart and applies a magnitude
//! mask to the weight before projecting. The operating mode decides when the
//! mask is recomputed; in [`SparsityMode::Inference`] no mask exists and the
//! layer is numerically identical to the dense layer.

pub mod attention;
pub mod hparams;
pub mod linear;
pub mod mask;

pub use attention::{SparseAttentionProjection, SparseCombinedQKVProjection};
pub use hparams::{SparsityHParams, SparsityMode, SparsityType, WeightSparsityParams};
pub use linear::SparseLinear;
pub use mask::{apply_sparsity, nm_sparsity_mask, SparsityState};
