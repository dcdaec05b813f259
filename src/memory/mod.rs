//! Device memory planning and allocation.
//!
//! The workspace makes exactly two device allocations: the binding stack,
//! from which every model's input/output tensors are carved, and the
//! activation space shared as scratch by all execution contexts. Both are
//! sized once, from the high-water marks the [`MemoryPlanner`] collects
//! while models are registered.

pub mod activation;
pub mod stack;

pub use activation::ActivationSpace;
pub use stack::{MemoryStack, StackError};

use crate::backend::Backend;
use crate::config::WorkspaceConfig;
use crate::model::Model;

/// Round `size` up to the next multiple of `alignment`.
///
/// Exact multiples, including zero, are returned unchanged.
pub fn align_up(size: usize, alignment: usize) -> usize {
    let remainder = size % alignment;
    if remainder == 0 {
        size
    } else {
        size + alignment - remainder
    }
}

/// Human-readable byte count, e.g. `1.5MiB`.
pub fn bytes_to_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

/// What a single model needs from the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelRequirements {
    /// Binding stack bytes, padded per slot and rounded to the stack
    /// granularity.
    pub bindings: usize,
    /// Activation bytes, rounded to the activation granularity.
    pub activations: usize,
    /// Weight bytes. Reported only.
    pub weights: usize,
}

/// The two workspace-wide allocation sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryPlan {
    pub binding_stack_bytes: usize,
    pub activation_bytes: usize,
}

impl MemoryPlan {
    pub fn is_empty(&self) -> bool {
        self.binding_stack_bytes == 0 && self.activation_bytes == 0
    }
}

/// Collects the high-water marks over all registered models.
#[derive(Debug, Clone)]
pub struct MemoryPlanner {
    stack_granularity: usize,
    activation_granularity: usize,
    plan: MemoryPlan,
}

impl MemoryPlanner {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            stack_granularity: config.stack_granularity,
            activation_granularity: config.activation_granularity,
            plan: MemoryPlan::default(),
        }
    }

    /// Requirements of `model` on a device with `alignment`-byte addressing.
    ///
    /// Each binding slot gets one extra `alignment` of padding so every slot
    /// can start on an aligned address when pushed onto the stack.
    pub fn requirements<B: Backend>(
        &self,
        model: &dyn Model<B>,
        alignment: usize,
    ) -> ModelRequirements {
        let bindings = model.binding_memory_size() + model.bindings_count() * alignment;
        ModelRequirements {
            bindings: align_up(bindings, self.stack_granularity),
            activations: align_up(model.activations_memory_size(), self.activation_granularity),
            weights: model.weights_memory_size(),
        }
    }

    /// Fold one model's requirements into the plan.
    pub fn fold(&mut self, req: &ModelRequirements) {
        self.plan.binding_stack_bytes = self.plan.binding_stack_bytes.max(req.bindings);
        self.plan.activation_bytes = self.plan.activation_bytes.max(req.activations);
    }

    pub fn plan(&self) -> MemoryPlan {
        self.plan
    }
}
