//! graph-workspace demo: register models on the simulated host device,
//! build their graphs, then serve a few lookups and launches.
//!
//! Run with `GRAPH_WORKSPACE_LOG_LEVEL=debug` to see the sizing report.

use graph_workspace::backend::host::{HostBackend, SyntheticModel};
use graph_workspace::logging::init_logging_from_env;
use graph_workspace::{Backend, GraphWorkspace, Model};
use std::sync::Arc;

fn main() {
    if let Err(e) = init_logging_from_env() {
        eprintln!("logging disabled: {e}");
    }

    let classifier: Arc<dyn Model<HostBackend>> = Arc::new(
        SyntheticModel::new(8)
            .with_input("image", 3 * 224 * 224 * 2)
            .with_output("logits", 1000 * 4)
            .with_activations(24 * 1024 * 1024)
            .with_weights(50 * 1024 * 1024),
    );
    let embedder: Arc<dyn Model<HostBackend>> = Arc::new(
        SyntheticModel::new(32)
            .with_input("tokens", 512 * 4)
            .with_output("embedding", 768 * 2)
            .with_activations(8 * 1024 * 1024),
    );

    let mut workspace = GraphWorkspace::new(HostBackend::default());
    for bs in [1, 4, 8] {
        workspace.register_model("classifier", classifier.clone(), bs);
    }
    for bs in [1, 16, 32] {
        workspace.register_model("embedder", embedder.clone(), bs);
    }
    workspace.build_graphs();

    let plan = workspace.memory_plan();
    println!("graph-workspace demo");
    println!("  binding stack: {} bytes", plan.binding_stack_bytes);
    println!("  activations:   {} bytes", plan.activation_bytes);
    for key in workspace.registered_keys() {
        println!("  graph ready: {key}");
    }
    println!();

    let requests = [("classifier", 4), ("embedder", 16), ("classifier", 2)];
    for (name, bs) in requests {
        match workspace.get_graph(name, bs) {
            Ok(exec) => {
                if let Err(e) = workspace.backend().launch(exec) {
                    eprintln!("  {name} bs={bs}: launch failed: {e}");
                    continue;
                }
                workspace.synchronize();
                println!("  {name} bs={bs}: launched");
            }
            Err(e) => println!("  {name} bs={bs}: rejected ({e})"),
        }
    }

    if let Ok(bindings) = workspace.device_bindings_by_name("embedder") {
        let addrs: Vec<String> = bindings.iter().map(|p| p.to_string()).collect();
        println!();
        println!("  embedder bindings: {}", addrs.join(", "));
    }
}
