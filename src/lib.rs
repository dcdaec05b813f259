//! graph-workspace: build-once, serve-many CUDA graph cache.
//!
//! Plans device memory once across a set of registered models, then
//! captures and caches one replayable graph per (model, batch size) so a
//! serving layer can launch inference with minimal per-request CPU work.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod model;
pub mod workspace;

pub use backend::{Backend, CaptureMode, DeviceBuffer, DeviceError, DevicePtr};
pub use config::WorkspaceConfig;
pub use error::{FatalError, WorkspaceError};
pub use model::{BindingInfo, ExecutionContext, Model, ModelError};
pub use workspace::{GraphWorkspace, ModelKey, Phase};
