//! Pairs a [`flow_kernel::graph::NodeSpec`] with the boxed async handler
//! that implements it, and gives node authors the `node.to(*successors)`
//! adjacency DSL (spec §6: "Users construct graphs via a node-builder DSL
//! where `node.to(*successors)` yields an adjacency pair").
//!
//! `flow-kernel` deliberately keeps `NodeSpec` free of the handler body so
//! it stays free of an `async_trait` dependency; this module is where the
//! two halves meet, mirroring how the donor's `DataflowBuilder`
//! (`mofa-runtime/src/native_dataflow/dataflow.rs`) separates node
//! configuration from the `NativeNode` that runs it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use flow_kernel::graph::{Adjacency, NodeSpec};
use flow_kernel::payload::Payload;
use flow_kernel::Message;

use crate::context::Context;

/// Bubbled by [`Context::pause`] (spec §4.3, §9): the worker loop catches
/// this, turns it into a `Payload::Pause` envelope, and routes it straight
/// to the egress instead of continuing the node's normal output routing.
#[derive(Debug, Clone)]
pub struct PauseSignal {
    pub reason: String,
    pub payload: serde_json::Value,
    pub resume_token: String,
}

/// Everything a node function can fail with other than a pause.
#[derive(Debug)]
pub struct NodeError(pub Box<dyn std::error::Error + Send + Sync>);

impl NodeError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }

    pub fn msg(text: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Msg(String);
        impl std::fmt::Display for Msg {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl std::error::Error for Msg {}
        Self(Box::new(Msg(text.into())))
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NodeError {}

/// The two ways a node function can fail (spec §4.4 step 5): an ordinary
/// exception that feeds into the retry/backoff loop, or a pause signal that
/// bypasses retries entirely and bubbles straight to the egress.
#[derive(Debug)]
pub enum NodeFailure {
    Pause(PauseSignal),
    Error(NodeError),
}

impl From<PauseSignal> for NodeFailure {
    fn from(p: PauseSignal) -> Self {
        NodeFailure::Pause(p)
    }
}

impl From<NodeError> for NodeFailure {
    fn from(e: NodeError) -> Self {
        NodeFailure::Error(e)
    }
}

/// What a node invocation produced.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Route this message to the node's successors (or the rookery, if the
    /// node is an egress node) — the ordinary case.
    Emit(Message),
    /// The node called `ctx.emit(...)` itself (e.g. to pick an explicit
    /// target, or to broadcast several distinct derived messages); the
    /// worker loop performs no further routing (spec §4.4 step 7).
    Routed,
}

/// A value a node can hand to [`Context::emit`]: either a bare payload
/// (derived from the in-flight message via "copy envelope, replace
/// payload", spec §3) or an already-built `Message`.
pub enum Emittable {
    Payload(Payload),
    Message(Message),
}

impl From<Payload> for Emittable {
    fn from(p: Payload) -> Self {
        Emittable::Payload(p)
    }
}

impl From<Message> for Emittable {
    fn from(m: Message) -> Self {
        Emittable::Message(m)
    }
}

impl From<&str> for Emittable {
    fn from(s: &str) -> Self {
        Emittable::Payload(Payload::from(s))
    }
}

impl From<String> for Emittable {
    fn from(s: String) -> Self {
        Emittable::Payload(Payload::from(s))
    }
}

impl From<serde_json::Value> for Emittable {
    fn from(v: serde_json::Value) -> Self {
        Emittable::Payload(Payload::from(v))
    }
}

pub type NodeResult = Result<NodeOutcome, NodeFailure>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The async callable every node wraps (spec §3: `func` is `(payload_or_
/// message, context) -> result`). Modeled as a trait (rather than a bare
/// `Fn`) so closures and hand-written structs with internal state — e.g.
/// `join_k`'s per-trace accumulator — implement it the same way.
#[async_trait]
pub trait NodeFn: Send + Sync {
    async fn call(&self, message: Message, ctx: Context) -> NodeResult;
}

/// Adapts a plain async closure into a [`NodeFn`], for the common case
/// where a node doesn't need to carry its own state.
pub struct FnNode<F>(pub F);

impl<F, Fut> FnNode<F>
where
    F: Fn(Message, Context) -> Fut + Send + Sync,
    Fut: Future<Output = NodeResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> NodeFn for FnNode<F>
where
    F: Fn(Message, Context) -> Fut + Send + Sync,
    Fut: Future<Output = NodeResult> + Send + 'static,
{
    async fn call(&self, message: Message, ctx: Context) -> NodeResult {
        (self.0)(message, ctx).await
    }
}

/// Wraps a closure that can't express its future type inline (e.g. one
/// built from a `Box::pin` block) — an escape hatch `FnNode` can't cover
/// because its `Fut` must be nameable.
pub struct BoxedFnNode<F>(pub F);

#[async_trait]
impl<F> NodeFn for BoxedFnNode<F>
where
    F: Fn(Message, Context) -> BoxFuture<'static, NodeResult> + Send + Sync,
{
    async fn call(&self, message: Message, ctx: Context) -> NodeResult {
        (self.0)(message, ctx).await
    }
}

/// A node declaration paired with its handler — what `create(...)` actually
/// consumes. `Node::to` yields the `(producer, successors)` adjacency pair
/// the spec's DSL describes.
#[derive(Clone)]
pub struct Node {
    pub spec: NodeSpec,
    pub func: Arc<dyn NodeFn>,
}

impl Node {
    pub fn new(spec: NodeSpec, func: impl NodeFn + 'static) -> Self {
        Self {
            spec,
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// `node.to(*successors)` — yields the adjacency this node declares.
    /// An empty successor list marks `self` as an egress node.
    pub fn to(&self, successors: &[&Node]) -> Adjacency {
        Adjacency::new(
            self.spec.name.clone(),
            successors.iter().map(|n| n.spec.name.clone()).collect(),
        )
    }

    /// Declares `self` as egress (no successors) without needing an empty
    /// slice literal at the call site.
    pub fn to_egress(&self) -> Adjacency {
        Adjacency::new(self.spec.name.clone(), Vec::<String>::new())
    }
}
