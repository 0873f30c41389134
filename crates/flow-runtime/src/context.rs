//! Per-invocation node handle (spec §4.3): `emit`, `fetch`, `emit_chunk`,
//! `emit_artifact`, `pause`, plus `tool_context` and cancellation checks.
//!
//! Grounded in the donor's `NativeNode::send_output`/`inject_event`
//! (`mofa-runtime/src/native_dataflow/node.rs`) for the emit/fetch
//! send-or-suspend shape, generalized from "one output port" to "route to
//! named successor edges, optionally broadcasting". A `Context` is built
//! fresh by the worker loop for each message and must not outlive that one
//! invocation (spec §9) — it owns `Arc`-shared edges and state rather than
//! borrowing them, so it can be moved into the node's future without a
//! lifetime parameter.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use flow_kernel::error::RuntimeError;
use flow_kernel::graph::FanOutMode;
use flow_kernel::stream::SeqAllocator;
use flow_kernel::Message;

use crate::node::{Emittable, NodeFailure, PauseSignal};
use crate::queue::Edge;

/// An object-safe hook for persisting completed artifacts out-of-band,
/// analogous to `mofa-kernel`'s replay/state-store callbacks but scoped to
/// binary artifact bytes rather than structured events. Nodes reach it via
/// [`Context::artifact_store`]; the core never calls it itself.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_chunk(&self, stream_id: &str, seq: u64, chunk: &[u8], done: bool);
}

#[derive(Clone)]
pub struct Context {
    node_name: Arc<str>,
    input: Message,
    out_edges: Arc<HashMap<String, Arc<Edge>>>,
    fan_out: FanOutMode,
    in_edges: Arc<Vec<Arc<Edge>>>,
    rookery: Arc<Edge>,
    cancel_token: CancellationToken,
    seq_alloc: Arc<Mutex<SeqAllocator>>,
    tool_context: Arc<Value>,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_name: Arc<str>,
        input: Message,
        out_edges: Arc<HashMap<String, Arc<Edge>>>,
        fan_out: FanOutMode,
        in_edges: Arc<Vec<Arc<Edge>>>,
        rookery: Arc<Edge>,
        cancel_token: CancellationToken,
        seq_alloc: Arc<Mutex<SeqAllocator>>,
        tool_context: Arc<Value>,
        artifact_store: Option<Arc<dyn ArtifactStore>>,
    ) -> Self {
        Self {
            node_name,
            input,
            out_edges,
            fan_out,
            in_edges,
            rookery,
            cancel_token,
            seq_alloc,
            tool_context,
            artifact_store,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The message that triggered this invocation — the basis for
    /// "copy envelope, replace payload" when a node hands `emit` a bare
    /// payload rather than a full `Message`.
    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn tool_context(&self) -> &Value {
        &self.tool_context
    }

    pub fn artifact_store(&self) -> Option<&Arc<dyn ArtifactStore>> {
        self.artifact_store.as_ref()
    }

    /// True once the in-flight trace has been cancelled — node authors
    /// doing long pure computation should poll this at natural breakpoints
    /// (spec §5: cancellation is cooperative, not preemptive).
    pub fn check_cancel(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    fn resolve_targets(&self, target: Option<&str>) -> Result<Vec<Arc<Edge>>, RuntimeError> {
        if let Some(name) = target {
            return match self.out_edges.get(name) {
                Some(edge) => Ok(vec![edge.clone()]),
                None => Err(RuntimeError::UnknownTarget(name.to_string())),
            };
        }
        match self.out_edges.len() {
            // An egress node has no successors of its own; fall back to the
            // rookery rather than silently dropping the message, mirroring
            // `route_output`'s egress fallback in the worker loop.
            0 => Ok(vec![self.rookery.clone()]),
            1 => Ok(self.out_edges.values().cloned().collect()),
            _ => match self.fan_out {
                FanOutMode::Broadcast => Ok(self.out_edges.values().cloned().collect()),
                FanOutMode::RequireTarget => {
                    Err(RuntimeError::AmbiguousEmit(self.node_name.to_string()))
                }
            },
        }
    }

    /// Enqueue `item` onto the node's out-edge(s) (spec §4.3). `target`
    /// selects a specific successor; omitted, a single successor is
    /// inferred automatically, and more than one requires either an
    /// explicit target or a broadcast policy.
    pub async fn emit(
        &self,
        item: impl Into<Emittable>,
        target: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let message = match item.into() {
            Emittable::Message(m) => m,
            Emittable::Payload(p) => self.input.with_payload(p),
        };
        let edges = self.resolve_targets(target)?;
        for edge in edges {
            self.put_cancellable(&edge, message.clone()).await?;
        }
        Ok(())
    }

    async fn put_cancellable(&self, edge: &Edge, message: Message) -> Result<(), RuntimeError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(RuntimeError::Cancelled),
            result = edge.put(message) => result.map_err(|_| RuntimeError::EdgeClosed),
        }
    }

    /// Await the next message from any declared in-edge (spec §4.3: "used
    /// by `join_k`"). Single-input nodes normally never call this — the
    /// worker loop already fetched their one message before invoking them.
    pub async fn fetch(&self) -> Result<Message, RuntimeError> {
        if self.in_edges.is_empty() {
            return Err(RuntimeError::Internal(
                "fetch() called on a node with no declared in-edges".to_string(),
            ));
        }
        let gets = self.in_edges.iter().map(|edge| Box::pin(edge.get()));
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(RuntimeError::Cancelled),
            (result, _, _) = futures::future::select_all(gets) => {
                result.map_err(|_| RuntimeError::EdgeClosed)
            }
        }
    }

    /// Wrap `text` into a `StreamChunk` derived from `parent`'s envelope
    /// and emit it. `seq` is caller-supplied or allocated monotonically per
    /// `stream_id` (spec §4.3, §4.8).
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_chunk(
        &self,
        parent: &Message,
        text: impl Into<String>,
        stream_id: impl Into<String>,
        done: bool,
        meta: Option<HashMap<String, Value>>,
        seq: Option<u64>,
    ) -> Result<(), RuntimeError> {
        let stream_id = stream_id.into();
        let seq = match seq {
            Some(s) => s,
            None => self.seq_alloc.lock().await.next_seq(&stream_id),
        };
        let mut chunk = flow_kernel::stream::StreamChunk::new(stream_id, seq, text, done);
        if let Some(meta) = meta {
            chunk.meta = meta;
        }
        let message = parent.with_payload(chunk);
        let edges = self.resolve_targets(None)?;
        for edge in edges {
            self.put_cancellable(&edge, message.clone()).await?;
        }
        Ok(())
    }

    /// Analogous to [`Context::emit_chunk`] for opaque artifact bytes,
    /// derived from the context's own input message (spec §4.3).
    pub async fn emit_artifact(
        &self,
        stream_id: impl Into<String>,
        chunk: Vec<u8>,
        done: bool,
        artifact_type: impl Into<String>,
        meta: Option<HashMap<String, Value>>,
    ) -> Result<(), RuntimeError> {
        let stream_id = stream_id.into();
        let seq = self.seq_alloc.lock().await.next_seq(&stream_id);
        if let Some(store) = &self.artifact_store {
            store.save_chunk(&stream_id, seq, &chunk, done).await;
        }
        let mut artifact_chunk =
            flow_kernel::stream::ArtifactChunk::new(stream_id, seq, chunk, artifact_type, done);
        if let Some(meta) = meta {
            artifact_chunk.meta = meta;
        }
        let message = self.input.with_payload(artifact_chunk);
        let edges = self.resolve_targets(None)?;
        for edge in edges {
            self.put_cancellable(&edge, message.clone()).await?;
        }
        Ok(())
    }

    /// Raise a pause signal (spec §4.3, §9): the worker loop catches this
    /// and routes a `Payload::Pause` envelope to the egress instead of the
    /// node's normal successors. Resume is a planner-layer concern, not a
    /// core operation.
    pub fn pause(&self, reason: impl Into<String>, payload: impl Into<Value>) -> NodeFailure {
        NodeFailure::Pause(PauseSignal {
            reason: reason.into(),
            payload: payload.into(),
            resume_token: flow_kernel::trace::new_trace_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_kernel::payload::Payload;

    fn msg() -> Message {
        Message::new("t1", Payload::user(serde_json::json!("hi")))
    }

    fn ctx_with_edges(edges: HashMap<String, Arc<Edge>>, fan_out: FanOutMode) -> Context {
        Context::new(
            Arc::from("n1"),
            msg(),
            Arc::new(edges),
            fan_out,
            Arc::new(Vec::new()),
            Edge::new(4),
            CancellationToken::new(),
            Arc::new(Mutex::new(SeqAllocator::new())),
            Arc::new(Value::Null),
            None,
        )
    }

    #[tokio::test]
    async fn emit_with_single_successor_needs_no_target() {
        let edge = Edge::new(4);
        let mut edges = HashMap::new();
        edges.insert("next".to_string(), edge.clone());
        let ctx = ctx_with_edges(edges, FanOutMode::RequireTarget);

        ctx.emit(Payload::user(serde_json::json!("out")), None)
            .await
            .unwrap();
        let got = edge.get().await.unwrap();
        assert_eq!(got.payload, Payload::user(serde_json::json!("out")));
    }

    #[tokio::test]
    async fn emit_with_multiple_successors_requires_target_unless_broadcast() {
        let a = Edge::new(4);
        let b = Edge::new(4);
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), a.clone());
        edges.insert("b".to_string(), b.clone());
        let ctx = ctx_with_edges(edges, FanOutMode::RequireTarget);

        let err = ctx.emit(Payload::user(serde_json::json!(1)), None).await;
        assert!(matches!(err, Err(RuntimeError::AmbiguousEmit(_))));
    }

    #[tokio::test]
    async fn emit_broadcasts_when_policy_says_so() {
        let a = Edge::new(4);
        let b = Edge::new(4);
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), a.clone());
        edges.insert("b".to_string(), b.clone());
        let ctx = ctx_with_edges(edges, FanOutMode::Broadcast);

        ctx.emit(Payload::user(serde_json::json!(1)), None)
            .await
            .unwrap();
        assert!(!a.is_empty().await);
        assert!(!b.is_empty().await);
    }

    #[tokio::test]
    async fn emit_chunk_allocates_monotonic_seq_when_unspecified() {
        let edge = Edge::new(4);
        let mut edges = HashMap::new();
        edges.insert("next".to_string(), edge.clone());
        let ctx = ctx_with_edges(edges, FanOutMode::RequireTarget);

        let parent = msg();
        ctx.emit_chunk(&parent, "a", "s1", false, None, None)
            .await
            .unwrap();
        ctx.emit_chunk(&parent, "b", "s1", true, None, None)
            .await
            .unwrap();

        let first = edge.get().await.unwrap();
        let second = edge.get().await.unwrap();
        let Payload::Chunk(c1) = first.payload else { panic!("expected chunk") };
        let Payload::Chunk(c2) = second.payload else { panic!("expected chunk") };
        assert_eq!(c1.seq, 0);
        assert_eq!(c2.seq, 1);
        assert!(c2.done);
    }

    #[test]
    fn pause_generates_a_distinct_resume_token() {
        let ctx = ctx_with_edges(HashMap::new(), FanOutMode::RequireTarget);
        let a = ctx.pause("need-input", serde_json::json!({}));
        let b = ctx.pause("need-input", serde_json::json!({}));
        match (a, b) {
            (NodeFailure::Pause(a), NodeFailure::Pause(b)) => {
                assert_ne!(a.resume_token, b.resume_token);
            }
            _ => panic!("expected pause signals"),
        }
    }
}
