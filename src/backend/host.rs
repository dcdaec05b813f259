//! Simulated host device.
//!
//! Implements [`Backend`] without a GPU. Allocations are synthetic aligned
//! address ranges, the stream records the operations execution contexts
//! enqueue on it, and capture moves those records into a graph instead.
//! Every allocation, release, capture and launch is appended to an event
//! log that outlives the backend, so release order can be checked after a
//! workspace is dropped.
//!
//! Faults can be armed one at a time with [`HostBackend::inject_fault`];
//! the next call at that point fails with [`DeviceError::Injected`].

use super::{Backend, CaptureMode, DeviceBuffer, DeviceError, DevicePtr};
use crate::config::ConfigError;
use crate::model::{BindingInfo, ExecutionContext, Model, ModelError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Where a one-shot fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Allocate,
    BeginCapture,
    EndCapture,
    Instantiate,
    Launch,
    Synchronize,
    DestroyGraphExec,
    DestroyGraph,
}

/// Something the simulated device did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Allocate { ptr: DevicePtr, bytes: usize },
    Free { ptr: DevicePtr },
    BeginCapture(CaptureMode),
    EndCapture { graph: u64, ops: usize },
    Instantiate { graph: u64, exec: u64 },
    Launch { exec: u64 },
    Synchronize,
    DestroyGraphExec { exec: u64 },
    DestroyGraph { graph: u64 },
}

/// One operation enqueued on a [`HostStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOp {
    pub kernel: String,
    pub batch_size: u32,
    pub args: Vec<DevicePtr>,
}

/// Configuration for the simulated device.
#[derive(Debug, Clone)]
pub struct HostBackendConfig {
    /// Addressing alignment of allocations, in bytes.
    pub alignment: usize,
    /// Whether relaxed capture is reported as available.
    pub supports_relaxed_capture: bool,
    /// First synthetic device address handed out.
    pub base_address: u64,
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        Self {
            alignment: 256,
            supports_relaxed_capture: true,
            base_address: 0x7f00_0000_0000,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    next_address: u64,
    next_handle: u64,
    live_buffers: usize,
    live_graphs: HashSet<u64>,
    live_execs: HashSet<u64>,
    faults: HashSet<FaultPoint>,
    events: Vec<HostEvent>,
}

impl DeviceState {
    fn take_fault(&mut self, point: FaultPoint) -> Result<(), DeviceError> {
        if self.faults.remove(&point) {
            Err(DeviceError::Injected(point))
        } else {
            Ok(())
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// The stream of the simulated device.
#[derive(Debug, Default)]
pub struct HostStream {
    capture: Mutex<Option<Vec<HostOp>>>,
    executed: Mutex<Vec<HostOp>>,
}

impl HostStream {
    /// Enqueue an operation. Recorded into the open capture if there is
    /// one, otherwise executed immediately.
    pub fn enqueue(&self, op: HostOp) {
        let mut capture = self.capture.lock();
        match capture.as_mut() {
            Some(ops) => ops.push(op),
            None => self.executed.lock().push(op),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Operations that ran eagerly or through graph launches, in order.
    pub fn executed(&self) -> Vec<HostOp> {
        self.executed.lock().clone()
    }
}

/// A synthetic device allocation.
#[derive(Debug)]
pub struct HostBuffer {
    ptr: DevicePtr,
    len: usize,
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceBuffer for HostBuffer {
    fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live_buffers -= 1;
        state.events.push(HostEvent::Free { ptr: self.ptr });
    }
}

/// A captured operation sequence.
#[derive(Debug)]
pub struct HostGraph {
    id: u64,
    ops: Arc<[HostOp]>,
}

impl HostGraph {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }
}

/// An instantiated [`HostGraph`].
#[derive(Debug, Clone)]
pub struct HostGraphExec {
    id: u64,
    ops: Arc<[HostOp]>,
}

impl HostGraphExec {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }
}

/// Read-only view of the device's bookkeeping that stays valid after the
/// backend itself is dropped.
#[derive(Debug, Clone)]
pub struct HostProbe {
    state: Arc<Mutex<DeviceState>>,
}

impl HostProbe {
    pub fn events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    /// Number of allocations made so far.
    pub fn allocation_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, HostEvent::Allocate { .. }))
            .count()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().live_buffers
    }

    pub fn live_graphs(&self) -> usize {
        self.state.lock().live_graphs.len()
    }

    pub fn live_graph_execs(&self) -> usize {
        self.state.lock().live_execs.len()
    }
}

/// The simulated device. Owns one [`HostStream`].
#[derive(Debug)]
pub struct HostBackend {
    config: HostBackendConfig,
    stream: HostStream,
    state: Arc<Mutex<DeviceState>>,
}

impl HostBackend {
    /// Create a simulated device. The alignment must be a power of two.
    pub fn new(config: HostBackendConfig) -> Result<Self, ConfigError> {
        if !config.alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment {
                alignment: config.alignment,
            });
        }
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: HostBackendConfig) -> Self {
        let state = DeviceState {
            next_address: config.base_address,
            ..Default::default()
        };
        Self {
            config,
            stream: HostStream::default(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Arm a one-shot fault at `point`.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().faults.insert(point);
    }

    pub fn probe(&self) -> HostProbe {
        HostProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::with_valid_config(HostBackendConfig::default())
    }
}

impl Backend for HostBackend {
    type Buffer = HostBuffer;
    type Graph = HostGraph;
    type GraphExec = HostGraphExec;
    type Stream = HostStream;

    fn alignment(&self) -> usize {
        self.config.alignment
    }

    fn allocate(&self, bytes: usize) -> Result<HostBuffer, DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Allocate)?;

        let ptr = DevicePtr(state.next_address);
        // Leave a gap so neighbouring allocations never share an address.
        let span = crate::memory::align_up(bytes.max(1), self.config.alignment);
        state.next_address += (span + self.config.alignment) as u64;
        state.live_buffers += 1;
        state.events.push(HostEvent::Allocate { ptr, bytes });

        Ok(HostBuffer {
            ptr,
            len: bytes,
            state: Arc::clone(&self.state),
        })
    }

    fn stream(&self) -> &HostStream {
        &self.stream
    }

    fn supports_relaxed_capture(&self) -> bool {
        self.config.supports_relaxed_capture
    }

    fn begin_capture(&self, mode: CaptureMode) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::BeginCapture)?;

        let mut capture = self.stream.capture.lock();
        if capture.is_some() {
            return Err(DeviceError::Capture("stream is already capturing".into()));
        }
        *capture = Some(Vec::new());
        state.events.push(HostEvent::BeginCapture(mode));
        Ok(())
    }

    fn end_capture(&self) -> Result<HostGraph, DeviceError> {
        let mut state = self.state.lock();
        let ops = self
            .stream
            .capture
            .lock()
            .take()
            .ok_or_else(|| DeviceError::Capture("stream is not capturing".into()))?;
        state.take_fault(FaultPoint::EndCapture)?;

        let id = state.handle();
        state.live_graphs.insert(id);
        state.events.push(HostEvent::EndCapture {
            graph: id,
            ops: ops.len(),
        });
        Ok(HostGraph {
            id,
            ops: ops.into(),
        })
    }

    fn instantiate(&self, graph: &HostGraph) -> Result<HostGraphExec, DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Instantiate)?;
        if !state.live_graphs.contains(&graph.id) {
            return Err(DeviceError::InvalidHandle(format!("graph {}", graph.id)));
        }

        let id = state.handle();
        state.live_execs.insert(id);
        state.events.push(HostEvent::Instantiate {
            graph: graph.id,
            exec: id,
        });
        Ok(HostGraphExec {
            id,
            ops: Arc::clone(&graph.ops),
        })
    }

    fn launch(&self, exec: &HostGraphExec) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Launch)?;
        if !state.live_execs.contains(&exec.id) {
            return Err(DeviceError::InvalidHandle(format!("graph exec {}", exec.id)));
        }
        state.events.push(HostEvent::Launch { exec: exec.id });
        drop(state);

        for op in exec.ops.iter() {
            self.stream.enqueue(op.clone());
        }
        Ok(())
    }

    fn destroy_graph_exec(&self, exec: HostGraphExec) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::DestroyGraphExec)?;
        if !state.live_execs.remove(&exec.id) {
            return Err(DeviceError::InvalidHandle(format!("graph exec {}", exec.id)));
        }
        state.events.push(HostEvent::DestroyGraphExec { exec: exec.id });
        Ok(())
    }

    fn destroy_graph(&self, graph: HostGraph) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::DestroyGraph)?;
        if !state.live_graphs.remove(&graph.id) {
            return Err(DeviceError::InvalidHandle(format!("graph {}", graph.id)));
        }
        state.events.push(HostEvent::DestroyGraph { graph: graph.id });
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Synchronize)?;
        state.events.push(HostEvent::Synchronize);
        Ok(())
    }
}

/// A model descriptor for the host backend with configurable sizing.
///
/// Its execution contexts enqueue a single `"<name>::forward"` op whose
/// arguments are the bindings followed by the activation base.
#[derive(Debug)]
pub struct SyntheticModel {
    name: Mutex<String>,
    max_batch_size: u32,
    bindings: Vec<BindingInfo>,
    activations_bytes: usize,
    weights_bytes: usize,
    fail_context_creation: bool,
    fail_enqueue: bool,
    contexts_created: AtomicUsize,
    contexts_live: Arc<AtomicUsize>,
}

impl SyntheticModel {
    pub fn new(max_batch_size: u32) -> Self {
        Self {
            name: Mutex::new(String::new()),
            max_batch_size,
            bindings: Vec::new(),
            activations_bytes: 0,
            weights_bytes: 0,
            fail_context_creation: false,
            fail_enqueue: false,
            contexts_created: AtomicUsize::new(0),
            contexts_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_input(mut self, name: &str, bytes_per_batch_item: usize) -> Self {
        self.bindings
            .push(BindingInfo::input(name, bytes_per_batch_item));
        self
    }

    pub fn with_output(mut self, name: &str, bytes_per_batch_item: usize) -> Self {
        self.bindings
            .push(BindingInfo::output(name, bytes_per_batch_item));
        self
    }

    pub fn with_activations(mut self, bytes: usize) -> Self {
        self.activations_bytes = bytes;
        self
    }

    pub fn with_weights(mut self, bytes: usize) -> Self {
        self.weights_bytes = bytes;
        self
    }

    /// Make `create_execution_context` fail.
    pub fn failing_context_creation(mut self) -> Self {
        self.fail_context_creation = true;
        self
    }

    /// Make every enqueue of its contexts fail.
    pub fn failing_enqueue(mut self) -> Self {
        self.fail_enqueue = true;
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    /// Contexts created and not yet dropped.
    pub fn contexts_live(&self) -> usize {
        self.contexts_live.load(Ordering::SeqCst)
    }
}

impl Model<HostBackend> for SyntheticModel {
    fn name(&self) -> String {
        self.name.lock().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    fn bindings_count(&self) -> usize {
        self.bindings.len()
    }

    fn binding(&self, index: usize) -> &BindingInfo {
        &self.bindings[index]
    }

    fn activations_memory_size(&self) -> usize {
        self.activations_bytes
    }

    fn weights_memory_size(&self) -> usize {
        self.weights_bytes
    }

    fn create_execution_context(
        &self,
    ) -> Result<Box<dyn ExecutionContext<HostBackend>>, ModelError> {
        if self.fail_context_creation {
            return Err(ModelError::ContextCreation(
                "synthetic context creation failure".into(),
            ));
        }
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.contexts_live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticContext {
            kernel: format!("{}::forward", self.name()),
            activations: None,
            bindings_count: self.bindings.len(),
            max_batch_size: self.max_batch_size,
            fail: self.fail_enqueue,
            live: Arc::clone(&self.contexts_live),
        }))
    }
}

struct SyntheticContext {
    kernel: String,
    activations: Option<DevicePtr>,
    bindings_count: usize,
    max_batch_size: u32,
    fail: bool,
    live: Arc<AtomicUsize>,
}

impl ExecutionContext<HostBackend> for SyntheticContext {
    fn set_device_memory(&mut self, activations: DevicePtr) {
        self.activations = Some(activations);
    }

    fn enqueue(
        &mut self,
        batch_size: u32,
        bindings: &[DevicePtr],
        stream: &HostStream,
    ) -> Result<(), ModelError> {
        let activations = self.activations.ok_or(ModelError::MissingDeviceMemory)?;
        if bindings.len() != self.bindings_count {
            return Err(ModelError::BindingCount {
                expected: self.bindings_count,
                actual: bindings.len(),
            });
        }
        if batch_size > self.max_batch_size {
            return Err(ModelError::Enqueue(format!(
                "batch size {} exceeds {}",
                batch_size, self.max_batch_size
            )));
        }
        if self.fail {
            return Err(ModelError::Enqueue(format!("{} rejected the launch", self.kernel)));
        }

        let mut args = bindings.to_vec();
        args.push(activations);
        stream.enqueue(HostOp {
            kernel: self.kernel.clone(),
            batch_size,
            args,
        });
        Ok(())
    }
}

impl Drop for SyntheticContext {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kernel: &str) -> HostOp {
        HostOp {
            kernel: kernel.into(),
            batch_size: 1,
            args: Vec::new(),
        }
    }

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let backend = HostBackend::default();
        let a = backend.allocate(100).unwrap();
        let b = backend.allocate(1).unwrap();
        assert!(a.device_ptr().is_aligned_to(256));
        assert!(b.device_ptr().is_aligned_to(256));
        assert!(b.device_ptr().addr() >= a.device_ptr().addr() + 100);
        assert_eq!(backend.probe().live_buffers(), 2);

        drop(a);
        drop(b);
        assert_eq!(backend.probe().live_buffers(), 0);
    }

    #[test]
    fn capture_records_instead_of_executing() {
        let backend = HostBackend::default();
        backend.stream().enqueue(op("eager"));

        backend.begin_capture(CaptureMode::Relaxed).unwrap();
        assert!(backend.stream().is_capturing());
        backend.stream().enqueue(op("captured"));
        let graph = backend.end_capture().unwrap();

        assert_eq!(graph.ops().len(), 1);
        assert_eq!(backend.stream().executed(), vec![op("eager")]);

        let exec = backend.instantiate(&graph).unwrap();
        backend.launch(&exec).unwrap();
        backend.launch(&exec).unwrap();
        assert_eq!(
            backend.stream().executed(),
            vec![op("eager"), op("captured"), op("captured")]
        );

        backend.destroy_graph_exec(exec).unwrap();
        backend.destroy_graph(graph).unwrap();
        assert_eq!(backend.probe().live_graphs(), 0);
        assert_eq!(backend.probe().live_graph_execs(), 0);
    }

    #[test]
    fn nested_capture_fails() {
        let backend = HostBackend::default();
        backend.begin_capture(CaptureMode::Global).unwrap();
        let err = backend.begin_capture(CaptureMode::Global).unwrap_err();
        assert!(matches!(err, DeviceError::Capture(_)));
    }

    #[test]
    fn end_capture_without_begin_fails() {
        let backend = HostBackend::default();
        assert!(matches!(
            backend.end_capture().unwrap_err(),
            DeviceError::Capture(_)
        ));
    }

    #[test]
    fn injected_fault_fires_once() {
        let backend = HostBackend::default();
        backend.inject_fault(FaultPoint::Synchronize);
        assert!(matches!(
            backend.synchronize().unwrap_err(),
            DeviceError::Injected(FaultPoint::Synchronize)
        ));
        backend.synchronize().unwrap();
    }

    #[test]
    fn double_destroy_is_invalid() {
        let backend = HostBackend::default();
        backend.begin_capture(CaptureMode::Relaxed).unwrap();
        let graph = backend.end_capture().unwrap();
        let exec = backend.instantiate(&graph).unwrap();
        let again = exec.clone();

        backend.destroy_graph_exec(exec).unwrap();
        assert!(matches!(
            backend.destroy_graph_exec(again).unwrap_err(),
            DeviceError::InvalidHandle(_)
        ));
    }

    #[test]
    fn synthetic_context_enqueues_bindings_and_scratch() {
        let backend = HostBackend::default();
        let model = SyntheticModel::new(4).with_input("x", 16).with_output("y", 4);
        model.set_name("toy");
        let mut ctx = model.create_execution_context().unwrap();

        let bindings = [DevicePtr(0x100), DevicePtr(0x200)];
        let err = ctx.enqueue(1, &bindings, backend.stream()).unwrap_err();
        assert!(matches!(err, ModelError::MissingDeviceMemory));

        ctx.set_device_memory(DevicePtr(0x900));
        ctx.enqueue(2, &bindings, backend.stream()).unwrap();
        let executed = backend.stream().executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].kernel, "toy::forward");
        assert_eq!(executed[0].batch_size, 2);
        assert_eq!(
            executed[0].args,
            vec![DevicePtr(0x100), DevicePtr(0x200), DevicePtr(0x900)]
        );

        assert_eq!(model.contexts_live(), 1);
        drop(ctx);
        assert_eq!(model.contexts_live(), 0);
        assert_eq!(model.contexts_created(), 1);
    }

    #[test]
    fn alignment_must_be_a_power_of_two() {
        for alignment in [0, 3, 384] {
            let err = HostBackend::new(HostBackendConfig {
                alignment,
                ..Default::default()
            })
            .unwrap_err();
            assert_eq!(err, ConfigError::InvalidAlignment { alignment });
        }
        let backend = HostBackend::new(HostBackendConfig {
            alignment: 512,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.alignment(), 512);
    }

    #[test]
    fn failing_enqueue_reports_model_error() {
        let backend = HostBackend::default();
        let model = SyntheticModel::new(4).with_input("x", 16).failing_enqueue();
        let mut ctx = model.create_execution_context().unwrap();
        ctx.set_device_memory(DevicePtr(0x900));
        let err = ctx.enqueue(1, &[DevicePtr(0x100)], backend.stream()).unwrap_err();
        assert!(matches!(err, ModelError::Enqueue(_)));
        assert!(backend.stream().executed().is_empty());
    }

    #[test]
    fn synthetic_context_rejects_wrong_binding_count() {
        let backend = HostBackend::default();
        let model = SyntheticModel::new(4).with_input("x", 16);
        let mut ctx = model.create_execution_context().unwrap();
        ctx.set_device_memory(DevicePtr(0x900));
        let err = ctx.enqueue(1, &[], backend.stream()).unwrap_err();
        assert!(matches!(
            err,
            ModelError::BindingCount {
                expected: 1,
                actual: 0
            }
        ));
    }
}
