//! Common multi-node shapes that a hand-written graph would otherwise
//! reimplement per project (spec §4.7): a bounded concurrent-map helper, a
//! stateful k-way join, predicate- and union-style routers, and an embedded
//! sub-flow invocation for controller playbooks.
//!
//! Grounded in the donor's `NativeDataflow` node/edge vocabulary
//! (`mofa-runtime/src/native_dataflow/`) for the join/router node shapes,
//! and in the benchmark call sites (`benchmarks/fanout_join.py`,
//! `benchmarks/controller_playbook.py`) for the exact signatures
//! `join_k(name, k)` and `call_playbook(build, msg)` are expected to have.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use flow_kernel::graph::{Adjacency, NodeSpec};
use flow_kernel::payload::Payload;
use flow_kernel::Message;

use crate::context::Context;
use crate::node::{Node, NodeError, NodeFailure, NodeFn, NodeOutcome, NodeResult};
use crate::runtime::{Runtime, RuntimeOptions};

/// Run `tasks` with at most `concurrency` in flight at once, preserving
/// input order in the returned `Vec` (spec §4.7: "a node author fanning out
/// sub-work without hand-rolling a semaphore"). Not itself a node — intended
/// to be called from within a node's handler body.
pub async fn map_concurrent<T, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> Vec<Fut::Output>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let f = Arc::new(f);
    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let semaphore = semaphore.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            f(item).await
        }));
    }
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.expect("map_concurrent task panicked"));
    }
    results
}

/// Best-effort extraction of a JSON value from any payload variant, used by
/// [`join_k`] to assemble its combined array without having to special-case
/// every payload kind. User records use their own value unchanged; every
/// other variant serializes structurally.
fn payload_to_value(payload: &Payload) -> Value {
    match payload {
        Payload::User(record) => record.value.clone(),
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

/// Accumulates one message per trace from each of `k` predecessor branches,
/// then emits a single combined message carrying a JSON array of the `k`
/// branch payloads in arrival order (spec §4.7, grounded in
/// `benchmarks/fanout_join.py`'s `join_k("join", branches)` usage, where the
/// downstream `summarize` node iterates `msg.payload` as a sequence).
struct JoinK {
    k: usize,
    pending: Mutex<HashMap<String, Vec<Value>>>,
}

#[async_trait]
impl NodeFn for JoinK {
    async fn call(&self, message: Message, _ctx: Context) -> NodeResult {
        let combined = {
            let mut pending = self.pending.lock().await;
            let parts = pending.entry(message.trace_id.clone()).or_default();
            parts.push(payload_to_value(&message.payload));
            if parts.len() < self.k {
                None
            } else {
                pending.remove(&message.trace_id)
            }
        };

        let Some(parts) = combined else {
            // Still waiting on the remaining branches for this trace;
            // nothing to route yet.
            return Ok(NodeOutcome::Routed);
        };

        // `NodeOutcome::Emit` lets the worker's own routing decide the
        // destination (successors, or the rookery if `join_k` is itself an
        // egress node) — calling `ctx.emit` here would only route through
        // this node's own out-edges, which is empty for the common
        // egress-join shape and would silently drop the combined message.
        Ok(NodeOutcome::Emit(
            message.with_payload(Payload::user(Value::Array(parts))),
        ))
    }
}

/// Build a join node that waits for `k` upstream branches per trace before
/// emitting once (spec §4.7). Every branch must route into this node's name
/// for the accumulator to ever complete.
pub fn join_k(name: impl Into<String>, k: usize) -> Node {
    Node::new(
        NodeSpec::new(name),
        JoinK {
            k,
            pending: Mutex::new(HashMap::new()),
        },
    )
}

/// Routes every message to exactly one successor chosen by `predicate`,
/// which maps a message to the target node name (spec §4.7). Requires the
/// node's policy to declare `RequireTarget` fan-out (the default) so an
/// unmatched predicate surfaces as an error rather than silently
/// broadcasting.
struct PredicateRouter<F> {
    predicate: F,
}

#[async_trait]
impl<F> NodeFn for PredicateRouter<F>
where
    F: Fn(&Message) -> String + Send + Sync,
{
    async fn call(&self, message: Message, ctx: Context) -> NodeResult {
        let target = (self.predicate)(&message);
        ctx.emit(message, Some(&target))
            .await
            .map_err(|e| NodeFailure::Error(NodeError::new(e)))?;
        Ok(NodeOutcome::Routed)
    }
}

/// Build a node that inspects each message and routes it to the single
/// successor `predicate` names (spec §4.7: "content-based branching without
/// a bespoke node per decision").
pub fn predicate_router(
    name: impl Into<String>,
    predicate: impl Fn(&Message) -> String + Send + Sync + 'static,
) -> Node {
    Node::new(NodeSpec::new(name), PredicateRouter { predicate })
}

/// Routes a message based on its payload's type, first match wins, with an
/// optional fallback target for payload types absent from `type_to_target`
/// (spec §4.7: "routes based on payload type (first match wins; fallback
/// optional)"). The type key is the payload's `schema_id` for a `User`
/// record when one is declared, falling back to [`Payload::type_name`]
/// otherwise, so a `union_router` can dispatch on an application-declared
/// record type as well as on the built-in envelope variants.
struct UnionRouter {
    type_to_target: HashMap<String, String>,
    fallback: Option<String>,
}

impl UnionRouter {
    fn target_for(&self, payload: &Payload) -> Option<&str> {
        let key = match payload {
            Payload::User(record) => record.schema_id.as_deref().unwrap_or(payload.type_name()),
            other => other.type_name(),
        };
        self.type_to_target
            .get(key)
            .or(self.fallback.as_ref())
            .map(String::as_str)
    }
}

#[async_trait]
impl NodeFn for UnionRouter {
    async fn call(&self, message: Message, ctx: Context) -> NodeResult {
        let target = self.target_for(&message.payload).map(str::to_string);
        let Some(target) = target else {
            return Err(NodeFailure::Error(NodeError::msg(format!(
                "union_router: no target registered for payload type `{}` and no fallback",
                message.payload.type_name()
            ))));
        };
        ctx.emit(message, Some(&target))
            .await
            .map_err(|e| NodeFailure::Error(NodeError::new(e)))?;
        Ok(NodeOutcome::Routed)
    }
}

/// Build a node that routes each message to the successor registered in
/// `type_to_target` for its payload type, falling back to `fallback` (if
/// given) when the type is unregistered (spec §4.7).
pub fn union_router(
    name: impl Into<String>,
    type_to_target: HashMap<String, String>,
    fallback: Option<String>,
) -> Node {
    Node::new(
        NodeSpec::new(name),
        UnionRouter {
            type_to_target,
            fallback,
        },
    )
}

/// Run a self-contained sub-flow for a single message and return its one
/// egress output (spec §4.7, grounded in
/// `benchmarks/controller_playbook.py`'s `call_playbook(build_playbook,
/// msg)`): builds the nodes/adjacencies `build` describes, starts a fresh
/// [`Runtime`], emits `message` into its first ingress node, awaits exactly
/// one rookery delivery, then tears the sub-flow down. Each call gets an
/// isolated runtime — playbooks do not share queues or trace state with the
/// parent graph or with each other.
pub async fn call_playbook(
    build: impl FnOnce() -> (Vec<Node>, Vec<Adjacency>),
    message: Message,
) -> Result<Message, NodeFailure> {
    let (nodes, adjacencies) = build();
    let ingress_name = nodes
        .first()
        .map(|n| n.spec.name.clone())
        .ok_or_else(|| NodeFailure::Error(NodeError::msg("call_playbook: no nodes declared")))?;

    let sub_flow = Runtime::create(nodes, adjacencies, RuntimeOptions::new())
        .map_err(|e| NodeFailure::Error(NodeError::msg(e.to_string())))?;
    sub_flow
        .run()
        .await
        .map_err(|e| NodeFailure::Error(NodeError::msg(e.to_string())))?;

    sub_flow
        .emit(&ingress_name, message)
        .await
        .map_err(|e| NodeFailure::Error(NodeError::msg(e.to_string())))?;

    let result = sub_flow
        .fetch()
        .await
        .map_err(|e| NodeFailure::Error(NodeError::msg(e.to_string())));

    sub_flow
        .stop()
        .await
        .map_err(|e| NodeFailure::Error(NodeError::msg(e.to_string())))?;

    result
}
