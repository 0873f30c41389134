//! The runtime facade (spec §3, §4.1, §4.5): validates a node/adjacency
//! declaration into a [`Graph`], wires a bounded [`Edge`] for every
//! connection plus a dedicated ingress edge per entry node and a shared
//! rookery egress edge, then spawns one worker task per node.
//!
//! Grounded in the donor's `NativeDataflow`/`DataflowBuilder`
//! (`mofa-runtime/src/native_dataflow/dataflow.rs`): a `Created → Running →
//! Stopped` state machine, a builder that validates before starting, and a
//! `stop()` that tears down background tasks without leaking. Generalized
//! from the donor's per-node raw-byte router to per-trace structured
//! `Message` routing driven directly by [`flow_kernel::graph::Graph`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use flow_kernel::error::{RuntimeError, RuntimeResult};
use flow_kernel::graph::{Adjacency, Graph, GraphBuilder};
use flow_kernel::trace::TraceRegistry;
use flow_kernel::Message;

use crate::config::{ErrorRoutingMode, RuntimeConfig};
use crate::context::ArtifactStore;
use crate::middleware::{Event, EventKind, Middleware, MiddlewareChain};
use crate::node::Node;
use crate::queue::{Closed, Edge};
use crate::state_store::{NullStateStore, StateStore};
use crate::worker::{spawn_worker, WorkerContext};

/// Lifecycle state of a [`Runtime`], mirroring the donor's
/// `Created`/`Running`/`Stopped` states minus the pause/resume states the
/// spec doesn't define (§9: "no pause/resume primitive at the core level").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    Created,
    Running,
    Stopped,
}

/// Optional collaborators a [`Runtime`] is built with, bundled the way the
/// donor's `DataflowConfig` bundles router tuning knobs (spec §4.1, §4.9).
#[derive(Default)]
pub struct RuntimeOptions {
    pub config: RuntimeConfig,
    pub state_store: Option<Arc<dyn StateStore>>,
    pub tool_context: Value,
    pub artifact_store: Option<Arc<dyn ArtifactStore>>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            state_store: None,
            tool_context: Value::Null,
            artifact_store: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_tool_context(mut self, value: Value) -> Self {
        self.tool_context = value;
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }
}

/// A validated, wired graph ready to run (spec §3 lifecycle: "no dynamic
/// topology"). Build with [`Runtime::create`], start with [`Runtime::run`].
pub struct Runtime {
    graph: Graph,
    ingress_edges: HashMap<String, Arc<Edge>>,
    internal_edges: Vec<Arc<Edge>>,
    rookery: Arc<Edge>,
    trace_registry: TraceRegistry,
    middleware: Arc<MiddlewareChain>,
    config: Arc<RuntimeConfig>,
    state: RwLock<RuntimeState>,
    worker_contexts: Mutex<Vec<WorkerContext>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Validate `nodes`/`adjacencies` into a [`Graph`], wire every edge
    /// (spec §4.1: one bounded FIFO per declared connection, plus a
    /// dedicated ingress edge per entry node and a shared rookery egress
    /// edge), and prepare — but do not yet spawn — a worker per node.
    pub fn create(
        nodes: Vec<Node>,
        adjacencies: Vec<Adjacency>,
        options: RuntimeOptions,
    ) -> RuntimeResult<Runtime> {
        let mut builder = GraphBuilder::new().queue_maxsize(options.config.queue_maxsize);
        for node in &nodes {
            builder = builder
                .node(node.spec.clone())
                .map_err(error_stack::Report::new)?;
        }
        for adj in adjacencies {
            builder = builder.adjacency(adj);
        }
        let graph = builder.build().map_err(error_stack::Report::new)?;

        let config = Arc::new(options.config);
        let rookery = Edge::new(config.boundary_queue_maxsize);
        let trace_registry = TraceRegistry::new();
        let middleware = Arc::new(MiddlewareChain::new());
        let state_store: Arc<dyn StateStore> = options
            .state_store
            .unwrap_or_else(|| Arc::new(NullStateStore));
        let tool_context = Arc::new(options.tool_context);

        let mut out_edges: HashMap<String, HashMap<String, Arc<Edge>>> = HashMap::new();
        let mut in_edges: HashMap<String, Vec<Arc<Edge>>> = HashMap::new();
        let mut internal_edges = Vec::new();
        for (producer, successors) in &graph.successors {
            for successor in successors {
                let edge = Edge::new(config.queue_maxsize);
                internal_edges.push(edge.clone());
                out_edges
                    .entry(producer.clone())
                    .or_default()
                    .insert(successor.clone(), edge.clone());
                in_edges.entry(successor.clone()).or_default().push(edge);
            }
        }

        let mut ingress_edges = HashMap::new();
        for name in &graph.ingress {
            let edge = Edge::new(config.boundary_queue_maxsize);
            ingress_edges.insert(name.clone(), edge.clone());
            in_edges.entry(name.clone()).or_default().push(edge);
        }

        let funcs: HashMap<String, Arc<dyn crate::node::NodeFn>> =
            nodes.iter().map(|n| (n.spec.name.clone(), n.func.clone())).collect();

        let mut worker_contexts = Vec::with_capacity(graph.nodes.len());
        for (name, spec) in &graph.nodes {
            let func = funcs
                .get(name)
                .cloned()
                .ok_or_else(|| error_stack::Report::new(RuntimeError::UnknownNode(name.clone())))?;
            worker_contexts.push(WorkerContext {
                spec: spec.clone(),
                func,
                in_edges: in_edges.remove(name).unwrap_or_default(),
                out_edges: out_edges.remove(name).unwrap_or_default(),
                rookery: rookery.clone(),
                trace_registry: trace_registry.clone(),
                middleware: middleware.clone(),
                config: config.clone(),
                state_store: state_store.clone(),
                tool_context: tool_context.clone(),
                artifact_store: options.artifact_store.clone(),
            });
        }

        Ok(Runtime {
            graph,
            ingress_edges,
            internal_edges,
            rookery,
            trace_registry,
            middleware,
            config,
            state: RwLock::new(RuntimeState::Created),
            worker_contexts: Mutex::new(worker_contexts),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn one worker task per node. Calling this more than once is an
    /// error — the graph's topology, like the donor's, is fixed once running
    /// (spec §3: "no dynamic topology").
    pub async fn run(&self) -> RuntimeResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != RuntimeState::Created {
                return Err(error_stack::Report::new(RuntimeError::Internal(
                    "run() called on a runtime that is not in the Created state".to_string(),
                )));
            }
            *state = RuntimeState::Running;
        }

        let contexts = std::mem::take(&mut *self.worker_contexts.lock().await);
        let mut handles = self.handles.lock().await;
        for wc in contexts {
            handles.push(spawn_worker(wc));
        }
        Ok(())
    }

    /// Deliver `message` to the named ingress node's dedicated queue, the
    /// sole sanctioned entry point for externally originated traces (spec
    /// §4.1: the anonymous "open-sea" boundary).
    pub async fn emit(&self, node_name: &str, message: Message) -> RuntimeResult<()> {
        let edge = self.ingress_edges.get(node_name).ok_or_else(|| {
            error_stack::Report::new(RuntimeError::UnknownTarget(node_name.to_string()))
                .attach_printable(format!("`{node_name}` is not a declared ingress node"))
        })?;
        edge.put(message)
            .await
            .map_err(|Closed| error_stack::Report::new(RuntimeError::EdgeClosed))
    }

    /// Await the next message delivered to the rookery (spec §4.1, §7). In
    /// [`ErrorRoutingMode::RaiseAtFetch`], a `FlowError` payload is converted
    /// into an `Err` here rather than handed back as ordinary data.
    pub async fn fetch(&self) -> RuntimeResult<Message> {
        let message = self
            .rookery
            .get()
            .await
            .map_err(|Closed| error_stack::Report::new(RuntimeError::EdgeClosed))?;
        if self.config.error_routing == ErrorRoutingMode::RaiseAtFetch {
            if let Some(err) = message.payload.as_error() {
                return Err(error_stack::Report::new(RuntimeError::Internal(err.to_string())));
            }
        }
        Ok(message)
    }

    /// Cancel every in-flight worker processing `trace_id`, emitting
    /// `trace_cancel_start`/`trace_cancel_finish` around the registry update
    /// (spec §4.5, §6). Returns `false` if the trace is unknown.
    pub async fn cancel(&self, trace_id: &str) -> bool {
        self.middleware
            .dispatch(Event::new(EventKind::TraceCancelStart, trace_id, "", 0))
            .await;
        let known = self.trace_registry.cancel(trace_id).await;
        self.middleware
            .dispatch(Event::new(EventKind::TraceCancelFinish, trace_id, "", 0))
            .await;
        known
    }

    pub async fn add_middleware(&self, middleware: Box<dyn Middleware>) {
        self.middleware.register(middleware).await;
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn active_trace_count(&self) -> usize {
        self.trace_registry.active_trace_count().await
    }

    /// Close every edge — ingress, internal, and the rookery — so every
    /// worker's fetch loop observes `Closed` and exits, then await every
    /// worker task (spec §3: graceful shutdown drains in-flight work rather
    /// than aborting it, mirroring the donor's `stop()` minus the abrupt
    /// `JoinHandle::abort` it uses for its single router task).
    pub async fn stop(&self) -> RuntimeResult<()> {
        {
            let mut state = self.state.write().await;
            *state = RuntimeState::Stopped;
        }

        for edge in self.ingress_edges.values() {
            edge.close();
        }
        for edge in &self.internal_edges {
            edge.close();
        }
        self.rookery.close();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle
                .await
                .map_err(|e| error_stack::Report::new(RuntimeError::Internal(e.to_string())))?;
        }
        Ok(())
    }
}

/// `Message::new(new_trace_id(), payload)` convenience matching the donor's
/// habit of stamping a fresh trace id at the boundary unless the caller
/// supplies their own (spec §3: "trace_id ... assigned by the caller or
/// generated at ingress").
pub fn new_ingress_message(payload: impl Into<flow_kernel::payload::Payload>) -> Message {
    Message::new(flow_kernel::trace::new_trace_id(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnNode, NodeOutcome};
    use flow_kernel::graph::NodeSpec;
    use flow_kernel::payload::Payload;

    fn passthrough_node(name: &str) -> Node {
        Node::new(
            NodeSpec::new(name),
            FnNode::new(|message: Message, _ctx| async move { Ok(NodeOutcome::Emit(message)) }),
        )
    }

    #[tokio::test]
    async fn linear_chain_delivers_emitted_message_to_rookery() {
        let a = passthrough_node("a");
        let b = passthrough_node("b");
        let adjacency = a.to(&[&b]);
        let egress_adjacency = b.to_egress();

        let runtime = Runtime::create(
            vec![a, b],
            vec![adjacency, egress_adjacency],
            RuntimeOptions::new(),
        )
        .unwrap();
        runtime.run().await.unwrap();

        let msg = new_ingress_message(Payload::user(serde_json::json!("hi")));
        let trace_id = msg.trace_id.clone();
        runtime.emit("a", msg).await.unwrap();

        let out = runtime.fetch().await.unwrap();
        assert_eq!(out.trace_id, trace_id);
        assert_eq!(out.payload, Payload::user(serde_json::json!("hi")));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn emit_to_unknown_ingress_node_is_rejected() {
        let a = passthrough_node("a");
        let egress_adjacency = a.to_egress();
        let runtime = Runtime::create(vec![a], vec![egress_adjacency], RuntimeOptions::new()).unwrap();
        runtime.run().await.unwrap();

        let err = runtime
            .emit("missing", new_ingress_message(Payload::user(serde_json::json!(1))))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RuntimeError::UnknownTarget(n) if n == "missing"
        ));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn running_twice_is_rejected() {
        let a = passthrough_node("a");
        let egress_adjacency = a.to_egress();
        let runtime = Runtime::create(vec![a], vec![egress_adjacency], RuntimeOptions::new()).unwrap();
        runtime.run().await.unwrap();
        assert!(runtime.run().await.is_err());
        runtime.stop().await.unwrap();
    }
}
