//! CUDA backend — device memory and stream capture via cudarc.
//!
//! Owns a context and one dedicated stream created for the workspace (not
//! the context's default stream, which other libraries may also use).
//! Graph capture, instantiation and teardown go through the raw driver API
//! so the graph and its executable keep separate lifetimes: the workspace
//! destroys every executable before any graph.

#[cfg(feature = "cuda")]
mod inner {
    use crate::backend::{Backend, CaptureMode, DeviceBuffer, DeviceError, DevicePtr};

    use cudarc::driver::sys::{self, CUgraph, CUgraphExec, CUstreamCaptureMode};
    use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr as _};

    use std::ptr;
    use std::sync::Arc;

    /// First driver version (10.1) with `CU_STREAM_CAPTURE_MODE_RELAXED`.
    const RELAXED_CAPTURE_DRIVER_VERSION: i32 = 10010;

    /// Device addressing alignment. cudaMalloc guarantees at least this.
    const DEVICE_ALIGNMENT: usize = 256;

    /// A device allocation owned by the backend's stream.
    pub struct CudaBuffer {
        _backing: CudaSlice<u8>,
        ptr: DevicePtr,
        len: usize,
    }

    impl DeviceBuffer for CudaBuffer {
        fn device_ptr(&self) -> DevicePtr {
            self.ptr
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    /// A captured `CUgraph`. Destroyed explicitly by the workspace.
    #[derive(Debug)]
    pub struct CudaGraphHandle(CUgraph);

    /// An instantiated `CUgraphExec`. This is what the workspace serves.
    #[derive(Debug, Clone, Copy)]
    pub struct CudaGraphExec(CUgraphExec);

    impl CudaGraphExec {
        pub fn as_raw(&self) -> CUgraphExec {
            self.0
        }
    }

    // SAFETY: graph and graph-exec handles are plain driver handles, not
    // tied to the creating thread. The workspace never mutates them after
    // build; launches are serialized on the one stream by the caller.
    unsafe impl Send for CudaGraphHandle {}
    unsafe impl Sync for CudaGraphHandle {}
    unsafe impl Send for CudaGraphExec {}
    unsafe impl Sync for CudaGraphExec {}

    pub struct CudaBackend {
        stream: Arc<CudaStream>,
        ctx: Arc<CudaContext>,
        relaxed_capture: bool,
    }

    impl CudaBackend {
        /// Create a context on device `ordinal` and a dedicated stream.
        pub fn new(ordinal: usize) -> Result<Self, DeviceError> {
            let ctx = CudaContext::new(ordinal)?;
            let stream = ctx.new_stream()?;

            let mut version = 0i32;
            unsafe { sys::cuDriverGetVersion(&mut version) }.result()?;
            tracing::debug!(ordinal, driver_version = version, "created CUDA backend");

            Ok(Self {
                stream,
                ctx,
                relaxed_capture: version >= RELAXED_CAPTURE_DRIVER_VERSION,
            })
        }

        pub fn cuda_stream(&self) -> &Arc<CudaStream> {
            &self.stream
        }

        /// Make the context current on the calling thread. Required before
        /// every raw driver call; launches and teardown may run on any thread.
        fn bind(&self) -> Result<(), DeviceError> {
            self.ctx.bind_to_thread()?;
            Ok(())
        }
    }

    impl Backend for CudaBackend {
        type Buffer = CudaBuffer;
        type Graph = CudaGraphHandle;
        type GraphExec = CudaGraphExec;
        type Stream = Arc<CudaStream>;

        fn alignment(&self) -> usize {
            DEVICE_ALIGNMENT
        }

        fn allocate(&self, bytes: usize) -> Result<CudaBuffer, DeviceError> {
            // Zero-byte allocations are rejected by the driver.
            let backing: CudaSlice<u8> = self.stream.alloc_zeros(bytes.max(1))?;
            let (raw, _guard) = backing.device_ptr(&self.stream);
            let ptr = DevicePtr(raw as u64);
            drop(_guard);
            Ok(CudaBuffer {
                _backing: backing,
                ptr,
                len: bytes,
            })
        }

        fn stream(&self) -> &Arc<CudaStream> {
            &self.stream
        }

        fn supports_relaxed_capture(&self) -> bool {
            self.relaxed_capture
        }

        fn begin_capture(&self, mode: CaptureMode) -> Result<(), DeviceError> {
            let mode = match mode {
                CaptureMode::Relaxed => CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_RELAXED,
                CaptureMode::Global => CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_GLOBAL,
            };
            self.bind()?;
            unsafe { sys::cuStreamBeginCapture_v2(self.stream.cu_stream(), mode) }.result()?;
            Ok(())
        }

        fn end_capture(&self) -> Result<CudaGraphHandle, DeviceError> {
            self.bind()?;
            let mut graph: CUgraph = ptr::null_mut();
            unsafe { sys::cuStreamEndCapture(self.stream.cu_stream(), &mut graph) }.result()?;
            if graph.is_null() {
                return Err(DeviceError::Capture("capture produced no graph".into()));
            }
            Ok(CudaGraphHandle(graph))
        }

        fn instantiate(&self, graph: &CudaGraphHandle) -> Result<CudaGraphExec, DeviceError> {
            self.bind()?;
            let mut exec: CUgraphExec = ptr::null_mut();
            unsafe { sys::cuGraphInstantiateWithFlags(&mut exec, graph.0, 0) }.result()?;
            Ok(CudaGraphExec(exec))
        }

        fn launch(&self, exec: &CudaGraphExec) -> Result<(), DeviceError> {
            self.bind()?;
            unsafe { sys::cuGraphLaunch(exec.0, self.stream.cu_stream()) }.result()?;
            Ok(())
        }

        fn destroy_graph_exec(&self, exec: CudaGraphExec) -> Result<(), DeviceError> {
            self.bind()?;
            unsafe { sys::cuGraphExecDestroy(exec.0) }.result()?;
            Ok(())
        }

        fn destroy_graph(&self, graph: CudaGraphHandle) -> Result<(), DeviceError> {
            self.bind()?;
            unsafe { sys::cuGraphDestroy(graph.0) }.result()?;
            Ok(())
        }

        fn synchronize(&self) -> Result<(), DeviceError> {
            self.stream.synchronize()?;
            Ok(())
        }
    }

}

#[cfg(feature = "cuda")]
pub use inner::{CudaBackend, CudaBuffer, CudaGraphExec, CudaGraphHandle};
