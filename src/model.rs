//! Model contract consumed by the workspace.
//!
//! The model representation itself lives outside this crate (a TensorRT
//! engine, a hand-written kernel pipeline, ...). The workspace only needs
//! its static sizing facts and a way to make an execution context that can
//! enqueue one inference onto a stream.

use crate::backend::{Backend, DevicePtr};
use thiserror::Error;

/// Errors raised by model collaborators.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to create execution context: {0}")]
    ContextCreation(String),

    #[error("device memory was not set before enqueue")]
    MissingDeviceMemory,

    #[error("expected {expected} bindings, got {actual}")]
    BindingCount { expected: usize, actual: usize },

    #[error("enqueue failed: {0}")]
    Enqueue(String),
}

/// One input/output tensor slot of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub name: String,
    /// Bytes needed for a single batch item.
    pub bytes_per_batch_item: usize,
    pub is_input: bool,
}

impl BindingInfo {
    pub fn input(name: &str, bytes_per_batch_item: usize) -> Self {
        Self {
            name: name.to_string(),
            bytes_per_batch_item,
            is_input: true,
        }
    }

    pub fn output(name: &str, bytes_per_batch_item: usize) -> Self {
        Self {
            name: name.to_string(),
            bytes_per_batch_item,
            is_input: false,
        }
    }

    /// Bytes needed to hold `batch_size` items.
    pub fn bytes_for_batch(&self, batch_size: u32) -> usize {
        self.bytes_per_batch_item * batch_size as usize
    }
}

/// Per-model runtime handle that binds device memory and enqueues a single
/// inference.
pub trait ExecutionContext<B: Backend>: Send + Sync {
    /// Point the context at its activation scratch memory.
    fn set_device_memory(&mut self, activations: DevicePtr);

    /// Enqueue one inference of `batch_size` items on `stream`.
    ///
    /// `bindings` holds one device pointer per binding slot, in slot order.
    fn enqueue(
        &mut self,
        batch_size: u32,
        bindings: &[DevicePtr],
        stream: &B::Stream,
    ) -> Result<(), ModelError>;
}

/// Static description of a model.
///
/// Shared between the workspace and whoever supplied it, hence `&self`
/// everywhere; `set_name` needs interior mutability.
pub trait Model<B: Backend>: Send + Sync {
    /// Display name, as last set by `set_name`.
    fn name(&self) -> String;

    fn set_name(&self, name: &str);

    fn max_batch_size(&self) -> u32;

    fn bindings_count(&self) -> usize;

    fn binding(&self, index: usize) -> &BindingInfo;

    /// Bytes needed for all bindings at the maximum batch size.
    fn binding_memory_size(&self) -> usize {
        (0..self.bindings_count())
            .map(|i| self.binding(i).bytes_for_batch(self.max_batch_size()))
            .sum()
    }

    /// Scratch memory one execution needs.
    fn activations_memory_size(&self) -> usize;

    /// Memory held by the weights. Reported, never allocated here.
    fn weights_memory_size(&self) -> usize {
        0
    }

    fn create_execution_context(&self) -> Result<Box<dyn ExecutionContext<B>>, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::SyntheticModel;

    #[test]
    fn binding_memory_size_uses_max_batch() {
        let model = SyntheticModel::new(8).with_input("x", 4).with_output("y", 12);
        assert_eq!(Model::binding_memory_size(&model), 8 * 4 + 8 * 12);
    }

    #[test]
    fn binding_info_constructors() {
        let b = BindingInfo::input("tokens", 2048);
        assert!(b.is_input);
        assert_eq!(b.bytes_for_batch(3), 6144);
        assert!(!BindingInfo::output("logits", 1).is_input);
    }

    #[test]
    fn set_name_round_trips() {
        let model = SyntheticModel::new(1);
        model.set_name("mnist");
        assert_eq!(Model::name(&model), "mnist");
    }
}
