#[cfg(test)]
mod attention_projection_tests;
#[cfg(test)]
mod sparse_linear_tests;
