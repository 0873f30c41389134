//! Deterministic test tooling (spec §9: "ship assertions for envelope
//! preservation and stream ordering, not a full simulator"): a
//! capture-recording middleware, a configurable fault-injecting node, and
//! assertion helpers for the two invariants the rest of the crate can't
//! check structurally — "copy envelope, replace payload" and strictly
//! increasing per-stream `seq`.
//!
//! Grounded in `mofa-testing`'s `MockAgentBus` (`mofa-testing/src/bus.rs`:
//! a capture-and-assert wrapper around the real bus) for the capture
//! pattern, and `mofa-bench`'s `MockLlmConfig`/`MockLlmBackend`
//! (`mofa-bench/src/mock_llm.rs`: a deterministic, configurably-behaved
//! stand-in) for the fault-injecting node's config shape.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use flow_kernel::payload::Payload;
use flow_kernel::Message;

use crate::context::Context;
use crate::middleware::{Event, Middleware};
use crate::node::{NodeError, NodeFailure, NodeFn, NodeOutcome, NodeResult};

/// Records every dispatched [`Event`] in order, for assertions like "this
/// node retried exactly twice then succeeded" without wiring up a bespoke
/// observer per test.
#[derive(Default, Clone)]
pub struct CapturingMiddleware {
    events: Arc<RwLock<Vec<Event>>>,
}

impl CapturingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub async fn events_for_trace(&self, trace_id: &str) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub async fn count_kind(&self, kind: &str) -> usize {
        self.events.read().await.iter().filter(|e| e.event == kind).count()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl Middleware for CapturingMiddleware {
    async fn on_event(&self, event: &Event) {
        self.events.write().await.push(event.clone());
    }
}

/// What a [`FlakyNode`] does on a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlakyBehavior {
    /// Return the input message unchanged.
    Succeed,
    /// Fail with a `NodeError`, feeding the worker's retry loop.
    Fail,
    /// Hang forever — used to exercise the `timeout_s` policy deterministically.
    HangForever,
}

/// A node whose behavior on the `n`th call (0-indexed) is looked up from a
/// fixed schedule, cycling if the schedule is shorter than the number of
/// calls made. Deterministic in place of the donor's latency/token
/// simulation — the spec's retry/timeout/pause semantics are structural,
/// not performance, concerns (spec §4.4, §5, §9).
pub struct FlakyNode {
    schedule: Vec<FlakyBehavior>,
    calls: AtomicUsize,
}

impl FlakyNode {
    pub fn new(schedule: Vec<FlakyBehavior>) -> Self {
        Self {
            schedule,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fails — the degenerate one-entry schedule.
    pub fn always_failing() -> Self {
        Self::new(vec![FlakyBehavior::Fail])
    }

    /// Fails `failures` times, then succeeds from the `failures`-th call on.
    pub fn fail_then_succeed(failures: usize) -> Self {
        let mut schedule = vec![FlakyBehavior::Fail; failures];
        schedule.push(FlakyBehavior::Succeed);
        Self::new(schedule)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeFn for FlakyNode {
    async fn call(&self, message: Message, _ctx: Context) -> NodeResult {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .schedule
            .get(attempt.min(self.schedule.len().saturating_sub(1)))
            .copied()
            .unwrap_or(FlakyBehavior::Succeed);

        match behavior {
            FlakyBehavior::Succeed => Ok(NodeOutcome::Emit(message)),
            FlakyBehavior::Fail => Err(NodeFailure::Error(NodeError::msg(format!(
                "flaky node failed on attempt {attempt}"
            )))),
            FlakyBehavior::HangForever => std::future::pending().await,
        }
    }
}

/// Assert that `derived` was produced from `original` via
/// `Message::with_payload` — every field but `payload` must be bitwise
/// identical (spec §3: "copy envelope, replace payload"). Panics with a
/// descriptive message on violation, matching the donor test suite's style
/// of plain `assert!`/`panic!` rather than a custom assertion framework.
pub fn assert_envelope_preserved(original: &Message, derived: &Message) {
    assert_eq!(
        original.trace_id, derived.trace_id,
        "trace_id must be preserved across a derived message"
    );
    assert_eq!(
        original.headers, derived.headers,
        "headers must be preserved across a derived message"
    );
    assert_eq!(
        original.deadline_s, derived.deadline_s,
        "deadline_s must be preserved across a derived message"
    );
    assert_eq!(
        original.meta, derived.meta,
        "meta must be preserved across a derived message"
    );
}

/// Assert that a sequence of [`Payload::Chunk`] messages has strictly
/// increasing `seq` and that exactly one chunk, carrying the maximum `seq`,
/// has `done = true` (spec §4.8's stream-ordering contract).
pub fn assert_stream_well_ordered(messages: &[Message]) {
    let mut last_seq: Option<u64> = None;
    let mut done_count = 0;
    let mut max_seq = 0;

    for message in messages {
        let Payload::Chunk(chunk) = &message.payload else {
            panic!("assert_stream_well_ordered given a non-chunk payload");
        };
        if let Some(prev) = last_seq {
            assert!(
                chunk.seq > prev,
                "stream seq must strictly increase: {prev} then {}",
                chunk.seq
            );
        }
        last_seq = Some(chunk.seq);
        max_seq = max_seq.max(chunk.seq);
        if chunk.done {
            done_count += 1;
        }
    }

    assert_eq!(done_count, 1, "exactly one chunk must be marked done");
    if let Some(last) = messages.last() {
        let Payload::Chunk(chunk) = &last.payload else {
            unreachable!()
        };
        assert!(
            chunk.done,
            "the done chunk must carry the maximum seq ({max_seq}), i.e. arrive last"
        );
    }
}
