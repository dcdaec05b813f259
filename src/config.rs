//! Workspace configuration.

use thiserror::Error;

/// Errors from configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    ZeroGranularity { field: &'static str },

    #[error("device alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },
}

/// Sizing granularities of the two workspace allocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Binding stack size is rounded up to a multiple of this.
    pub stack_granularity: usize,

    /// Activation space size is rounded up to a multiple of this. Coarse
    /// enough that scratch of different models never shares a cache line.
    pub activation_granularity: usize,
}

impl WorkspaceConfig {
    /// Default granularity for both allocations: 128 KiB.
    pub const DEFAULT_GRANULARITY: usize = 128 * 1024;

    pub fn with_stack_granularity(mut self, bytes: usize) -> Self {
        self.stack_granularity = bytes;
        self
    }

    pub fn with_activation_granularity(mut self, bytes: usize) -> Self {
        self.activation_granularity = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_granularity == 0 {
            return Err(ConfigError::ZeroGranularity {
                field: "stack_granularity",
            });
        }
        if self.activation_granularity == 0 {
            return Err(ConfigError::ZeroGranularity {
                field: "activation_granularity",
            });
        }
        Ok(())
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            stack_granularity: Self::DEFAULT_GRANULARITY,
            activation_granularity: Self::DEFAULT_GRANULARITY,
        }
    }
}
