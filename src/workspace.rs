//! Graph workspace — plans device memory once across registered models and
//! caches one instantiated graph per (model, batch size).
//!
//! ```ignore
//! let mut ws = GraphWorkspace::new(backend);
//! ws.register_model("resnet", resnet.clone(), 1);
//! ws.register_model("resnet", resnet, 8);
//! ws.build_graphs();
//!
//! // serving threads
//! let exec = ws.get_graph("resnet", 8)?;
//! ws.backend().launch(exec)?;
//! ws.synchronize();
//! ```
//!
//! The lifecycle is strictly two-phase. While `Registering`, models are
//! added and the memory plan grows. `build_graphs()` freezes the plan,
//! makes the two device allocations and captures every graph; after that
//! the workspace is read-only and lookups may run from many threads.
//! Configuration mistakes and device faults are fatal (see
//! [`crate::error::fatal`]); lookups of unknown keys are ordinary errors.

use crate::backend::{Backend, CaptureMode, DevicePtr};
use crate::config::{ConfigError, WorkspaceConfig};
use crate::error::{fatal, FatalError, OrFatal, WorkspaceError};
use crate::memory::{bytes_to_string, ActivationSpace, MemoryPlan, MemoryPlanner, MemoryStack};
use crate::model::{ExecutionContext, Model};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identifies one registered configuration: a model name and a batch size.
///
/// Ordered by name, then batch size. Graphs are built in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelKey {
    pub name: String,
    pub batch_size: u32,
}

impl ModelKey {
    pub fn new(name: &str, batch_size: u32) -> Self {
        Self {
            name: name.to_string(),
            batch_size,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@bs{}", self.name, self.batch_size)
    }
}

/// Lifecycle phase of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Models may be registered; the memory plan is still growing.
    Registering,
    /// `build_graphs()` has run. The plan is frozen and the cache read-only.
    Built,
}

/// The workspace.
///
/// Field order is drop order for whatever `Drop` leaves behind; the backend
/// (and with it the stream) goes last.
pub struct GraphWorkspace<B: Backend> {
    phase: Phase,
    planner: MemoryPlanner,

    /// Registered models by name.
    models: BTreeMap<String, Arc<dyn Model<B>>>,
    /// Registered models by (name, batch size).
    models_by_key: BTreeMap<ModelKey, Arc<dyn Model<B>>>,
    /// One execution context per model name.
    contexts: BTreeMap<String, Box<dyn ExecutionContext<B>>>,

    /// Binding addresses per model name, shared by all its batch sizes.
    device_bindings: HashMap<String, Vec<DevicePtr>>,
    /// Captured graphs, kept only so they can be destroyed.
    graphs: BTreeMap<ModelKey, B::Graph>,
    /// What lookups serve.
    graph_execs: HashMap<ModelKey, B::GraphExec>,

    bindings_stack: Option<MemoryStack<B>>,
    activations: Option<ActivationSpace<B>>,

    backend: B,
}

impl<B: Backend> GraphWorkspace<B> {
    /// Create a workspace with the default [`WorkspaceConfig`].
    pub fn new(backend: B) -> Self {
        Self::build(backend, &WorkspaceConfig::default())
    }

    pub fn with_config(backend: B, config: WorkspaceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(backend, &config))
    }

    fn build(backend: B, config: &WorkspaceConfig) -> Self {
        tracing::debug!(
            alignment = backend.alignment(),
            stack_granularity = config.stack_granularity,
            activation_granularity = config.activation_granularity,
            "creating graph workspace"
        );
        Self {
            phase: Phase::Registering,
            planner: MemoryPlanner::new(config),
            models: BTreeMap::new(),
            models_by_key: BTreeMap::new(),
            contexts: BTreeMap::new(),
            device_bindings: HashMap::new(),
            graphs: BTreeMap::new(),
            graph_execs: HashMap::new(),
            bindings_stack: None,
            activations: None,
            backend,
        }
    }

    /// Register `model` under `name` at `batch_size`.
    ///
    /// The same model may be registered at several batch sizes; its
    /// execution context is created on the first registration of the name.
    ///
    /// # Panics
    /// Fatal if graphs were already built, if `batch_size` is zero or above
    /// the model's maximum, if `(name, batch_size)` is already registered,
    /// if `name` is bound to a different model, or if the model fails to
    /// create an execution context. Nothing is recorded when it panics.
    pub fn register_model(&mut self, name: &str, model: Arc<dyn Model<B>>, batch_size: u32) {
        self.try_register(name, model, batch_size).or_fatal();
    }

    fn try_register(
        &mut self,
        name: &str,
        model: Arc<dyn Model<B>>,
        batch_size: u32,
    ) -> Result<(), FatalError> {
        if self.phase != Phase::Registering {
            return Err(FatalError::RegistrationClosed { name: name.into() });
        }
        if batch_size == 0 {
            return Err(FatalError::ZeroBatchSize { name: name.into() });
        }
        let max_batch_size = model.max_batch_size();
        if batch_size > max_batch_size {
            return Err(FatalError::BatchSizeExceeded {
                name: name.into(),
                batch_size,
                max_batch_size,
            });
        }

        let key = ModelKey::new(name, batch_size);
        if self.models_by_key.contains_key(&key) {
            return Err(FatalError::DuplicateModel {
                name: name.into(),
                batch_size,
            });
        }
        if let Some(existing) = self.models.get(name) {
            if !same_model(existing, &model) {
                return Err(FatalError::ModelNameConflict { name: name.into() });
            }
        }

        // Contexts may pick up the display name, so set it first and put the
        // old one back if the context cannot be created.
        let previous_name = model.name();
        model.set_name(name);
        let context = if self.contexts.contains_key(name) {
            None
        } else {
            match model.create_execution_context() {
                Ok(ctx) => Some(ctx),
                Err(source) => {
                    model.set_name(&previous_name);
                    return Err(FatalError::Model {
                        name: name.into(),
                        source,
                    });
                }
            }
        };

        let req = self.planner.requirements(model.as_ref(), self.backend.alignment());
        self.planner.fold(&req);

        tracing::debug!(model = name, batch_size, "registering model");
        tracing::debug!(
            model = name,
            "input/output tensors require {}",
            bytes_to_string(req.bindings)
        );
        tracing::debug!(
            model = name,
            "execution activations require {}",
            bytes_to_string(req.activations)
        );
        if req.weights > 0 {
            tracing::debug!(model = name, "weights require {}", bytes_to_string(req.weights));
        }

        if let Some(ctx) = context {
            self.contexts.insert(name.to_string(), ctx);
        }
        self.models.insert(name.to_string(), Arc::clone(&model));
        self.models_by_key.insert(key, model);
        Ok(())
    }

    /// Allocate device memory from the frozen plan and capture one graph per
    /// registered key.
    ///
    /// Closes registration even when nothing is registered, in which case
    /// no memory is allocated.
    ///
    /// # Panics
    /// Fatal if called twice, or on any device or enqueue failure.
    pub fn build_graphs(&mut self) {
        self.try_build().or_fatal();
    }

    fn try_build(&mut self) -> Result<(), FatalError> {
        if self.phase == Phase::Built {
            return Err(FatalError::AlreadyBuilt);
        }
        self.phase = Phase::Built;

        if self.models.is_empty() {
            tracing::info!("no graphs registered");
            return Ok(());
        }

        // Both allocations are owned by `self` from here on, so a fatal error
        // mid-build still releases them after the graphs captured so far.
        let plan = self.planner.plan();
        let stack = self.bindings_stack.insert(
            MemoryStack::new(&self.backend, plan.binding_stack_bytes)
                .map_err(FatalError::device("binding stack allocation"))?,
        );
        let activation_base = self
            .activations
            .insert(
                ActivationSpace::new(&self.backend, plan.activation_bytes)
                    .map_err(FatalError::device("activation allocation"))?,
            )
            .data();

        let mode = CaptureMode::select(&self.backend);
        tracing::debug!(?mode, "selected stream capture mode");

        for (key, model) in &self.models_by_key {
            tracing::debug!(model = %key.name, batch_size = key.batch_size, "building graph");

            let ctx = self
                .contexts
                .get_mut(&key.name)
                .expect("every registered name has an execution context");
            ctx.set_device_memory(activation_base);

            // Pushed once per name, sized for max batch size; every batch
            // size of the model bakes in the same addresses.
            if !self.device_bindings.contains_key(&key.name) {
                let max_batch_size = model.max_batch_size();
                let mut bindings = Vec::with_capacity(model.bindings_count());
                for i in 0..model.bindings_count() {
                    let size = model.binding(i).bytes_for_batch(max_batch_size);
                    let ptr = stack
                        .allocate(size)
                        .map_err(|source| FatalError::BindingStack {
                            name: key.name.clone(),
                            source,
                        })?;
                    bindings.push(ptr);
                }
                self.device_bindings.insert(key.name.clone(), bindings);
            }
            let bindings = &self.device_bindings[&key.name];

            self.backend
                .begin_capture(mode)
                .map_err(FatalError::device("begin capture"))?;
            if let Err(source) = ctx.enqueue(key.batch_size, bindings, self.backend.stream()) {
                // Close the capture so the stream is usable for teardown.
                if let Ok(partial) = self.backend.end_capture() {
                    let _ = self.backend.destroy_graph(partial);
                }
                return Err(FatalError::Model {
                    name: key.name.clone(),
                    source,
                });
            }
            let graph = self
                .backend
                .end_capture()
                .map_err(FatalError::device("end capture"))?;

            self.graphs.insert(key.clone(), graph);

            stack.reset();

            let exec = self
                .backend
                .instantiate(&self.graphs[key])
                .map_err(FatalError::device("graph instantiation"))?;
            self.graph_execs.insert(key.clone(), exec);
        }

        tracing::info!(
            graphs = self.graph_execs.len(),
            models = self.models.len(),
            binding_stack = %bytes_to_string(plan.binding_stack_bytes),
            activations = %bytes_to_string(plan.activation_bytes),
            "built graph workspace"
        );

        Ok(())
    }

    pub fn is_model_registered(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn is_graph_available(&self, name: &str, batch_size: u32) -> bool {
        self.graph_execs
            .contains_key(&ModelKey::new(name, batch_size))
    }

    /// The graph executor for `(name, batch_size)`.
    pub fn get_graph(&self, name: &str, batch_size: u32) -> Result<&B::GraphExec, WorkspaceError> {
        self.graph_execs
            .get(&ModelKey::new(name, batch_size))
            .ok_or_else(|| WorkspaceError::GraphNotFound {
                name: name.to_string(),
                batch_size,
            })
    }

    /// Binding addresses baked into every graph of model `name`, one per
    /// binding slot.
    pub fn device_bindings_by_name(&self, name: &str) -> Result<&[DevicePtr], WorkspaceError> {
        self.device_bindings
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| WorkspaceError::BindingsNotFound {
                name: name.to_string(),
            })
    }

    /// Block until all work on the workspace stream has completed.
    ///
    /// # Panics
    /// Fatal if the stream reports a fault.
    pub fn synchronize(&self) {
        self.backend
            .synchronize()
            .map_err(FatalError::device("stream synchronize"))
            .or_fatal();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The high-water marks collected so far.
    pub fn memory_plan(&self) -> MemoryPlan {
        self.planner.plan()
    }

    pub fn registered_keys(&self) -> impl Iterator<Item = &ModelKey> {
        self.models_by_key.keys()
    }

    pub fn model(&self, name: &str) -> Option<&Arc<dyn Model<B>>> {
        self.models.get(name)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Synchronize, then release executors, graphs, contexts and the two
    /// allocations, in that order.
    fn teardown(&mut self) -> Result<(), FatalError> {
        tracing::debug!("tearing down graph workspace");
        self.backend
            .synchronize()
            .map_err(FatalError::device("stream synchronize"))?;

        tracing::debug!(count = self.graph_execs.len(), "destroying graph executors");
        for (_, exec) in self.graph_execs.drain() {
            self.backend
                .destroy_graph_exec(exec)
                .map_err(FatalError::device("graph executor destroy"))?;
        }

        tracing::debug!(count = self.graphs.len(), "destroying graphs");
        while let Some((_, graph)) = self.graphs.pop_first() {
            self.backend
                .destroy_graph(graph)
                .map_err(FatalError::device("graph destroy"))?;
        }

        self.contexts.clear();
        self.bindings_stack.take();
        self.activations.take();
        Ok(())
    }
}

impl<B: Backend> Drop for GraphWorkspace<B> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            if std::thread::panicking() {
                tracing::error!(error = %err, "graph workspace teardown failed while unwinding");
            } else {
                fatal(err);
            }
        }
    }
}

/// Whether two handles point at the same model object.
fn same_model<B: Backend>(a: &Arc<dyn Model<B>>, b: &Arc<dyn Model<B>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
