//! Execution engine for the dataflow runtime: the bounded queue edges,
//! per-invocation node context, middleware dispatch, retry/backoff, the
//! worker lifecycle loop, the runtime facade, and the multi-node patterns
//! (`map_concurrent`, `join_k`, routers, `call_playbook`) built on top of
//! `flow-kernel`'s graph, envelope, and budget types.
//!
//! `flow-kernel` defines what a node, edge, and message *are*; this crate
//! runs them.

pub mod budget_apply;
pub mod config;
pub mod context;
pub mod middleware;
pub mod node;
pub mod patterns;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod state_store;
pub mod testkit;
pub mod worker;

pub use config::{ErrorRoutingMode, RuntimeConfig};
pub use context::{ArtifactStore, Context};
pub use middleware::{Event, EventKind, FnMiddleware, Middleware, MiddlewareChain};
pub use node::{
    BoxedFnNode, Emittable, FnNode, Node, NodeError, NodeFailure, NodeFn, NodeOutcome, NodeResult,
    PauseSignal,
};
pub use patterns::{call_playbook, join_k, map_concurrent, predicate_router, union_router};
pub use queue::{Closed, Edge};
pub use runtime::{new_ingress_message, Runtime, RuntimeOptions};
pub use state_store::{InMemoryStateStore, NullStateStore, StateEvent, StateStore};

// Re-exported for callers who only depend on `flow-runtime` and don't want
// a direct `flow-kernel` dependency for the envelope/payload types every
// node signature touches.
pub use flow_kernel::{FlowError, FlowErrorCode, Message, Payload, RuntimeError, RuntimeResult};
