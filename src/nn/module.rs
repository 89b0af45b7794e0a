//! Module defining the core `Module` trait for all neural network layers.

use crate::tensor::{Tensor, Variable};

/// Trait defining the common interface for all layers/modules.
///
/// In the graph-based architecture, `Module` is any component that can
/// add a specific pattern of operations and variables to the graph.
pub trait Module {
    /// Layer name; also the name scope of its variables and operations.
    fn name(&self) -> &str;

    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Returns all trainable variables of this module.
    fn parameters(&self) -> Vec<Variable> {
        Vec::new()
    }
}
