#[cfg(feature = "safe_tensors")]
pub mod safetensors_loader;
