//! Device backend trait and implementations.
//!
//! The backend is the cutpoint between the workspace's bookkeeping and the
//! GPU. It owns the single stream everything is captured and replayed on,
//! hands out device allocations and wraps the graph capture / instantiate /
//! destroy calls. Any backend that implements `Backend` can host a
//! `GraphWorkspace` — the CUDA driver, or the simulated host device used
//! for tests.

pub mod cuda;
pub mod host;

use std::fmt;
use thiserror::Error;

/// Errors from device backends.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("stream capture error: {0}")]
    Capture(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("injected fault at {0:?}")]
    Injected(host::FaultPoint),
}

/// A raw device address.
///
/// This is what gets baked into a captured graph, so it must stay valid for
/// as long as the graph exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn is_aligned_to(self, alignment: usize) -> bool {
        self.0 % alignment as u64 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How strictly a stream capture guards against unsafe API calls made by
/// other threads while it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Only forbids calls on this thread that are unsafe during capture.
    Relaxed,
    /// Forbids unsafe calls from any thread. Available everywhere.
    Global,
}

impl CaptureMode {
    /// The most permissive mode the backend supports.
    pub fn select<B: Backend + ?Sized>(backend: &B) -> Self {
        if backend.supports_relaxed_capture() {
            CaptureMode::Relaxed
        } else {
            CaptureMode::Global
        }
    }
}

/// A device allocation. Freed when dropped.
pub trait DeviceBuffer: Send + Sync {
    /// Base address of the allocation.
    fn device_ptr(&self) -> DevicePtr;

    /// Size of the allocation in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The device contract used by the workspace.
///
/// All methods act on the backend's one dedicated stream.
pub trait Backend: Send + Sync {
    type Buffer: DeviceBuffer;
    /// A captured, immutable operation graph.
    type Graph: Send + Sync;
    /// An instantiated graph, ready to launch.
    type GraphExec: Send + Sync;
    /// Whatever execution contexts enqueue their work on.
    type Stream: Send + Sync;

    /// Device addressing alignment in bytes.
    fn alignment(&self) -> usize;

    /// Allocate `bytes` of device memory.
    fn allocate(&self, bytes: usize) -> Result<Self::Buffer, DeviceError>;

    /// The dedicated stream.
    fn stream(&self) -> &Self::Stream;

    /// Whether `CaptureMode::Relaxed` is available on this platform.
    fn supports_relaxed_capture(&self) -> bool;

    fn begin_capture(&self, mode: CaptureMode) -> Result<(), DeviceError>;

    fn end_capture(&self) -> Result<Self::Graph, DeviceError>;

    fn instantiate(&self, graph: &Self::Graph) -> Result<Self::GraphExec, DeviceError>;

    /// Enqueue a replay of `exec` on the stream.
    fn launch(&self, exec: &Self::GraphExec) -> Result<(), DeviceError>;

    fn destroy_graph_exec(&self, exec: Self::GraphExec) -> Result<(), DeviceError>;

    fn destroy_graph(&self, graph: Self::Graph) -> Result<(), DeviceError>;

    /// Block until all work on the stream has completed.
    fn synchronize(&self) -> Result<(), DeviceError>;
}
