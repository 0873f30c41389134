//! The trace registry: `trace_id → (set of active worker tasks, cancel
//! flag, start timestamp)` (spec §3/§4.5).
//!
//! Generalizes the donor kernel's `AgentInterrupt`
//! (`mofa-kernel/src/core/interrupt.rs`) — a single `Notify` +
//! `AtomicBool` pair scoped to one node — into a registry keyed by
//! `trace_id`, since cancellation here is trace-scoped, not node-scoped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// One trace's bookkeeping: how many workers currently have this trace
/// in flight, the token they all select on, and when the trace was first
/// observed.
#[derive(Clone)]
pub struct TraceEntry {
    pub token: CancellationToken,
    pub started_at: f64,
    active_workers: Arc<std::sync::atomic::AtomicI64>,
}

impl TraceEntry {
    fn new(now: f64) -> Self {
        Self {
            token: CancellationToken::new(),
            started_at: now,
            active_workers: Arc::new(std::sync::atomic::AtomicI64::new(0)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn active_count(&self) -> i64 {
        self.active_workers.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Runtime-scoped map of in-flight traces. Populated on first observation of
/// a `trace_id` at any node boundary; torn down when no further work for
/// that trace is in flight.
#[derive(Clone)]
pub struct TraceRegistry {
    inner: Arc<RwLock<HashMap<String, TraceEntry>>>,
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register the current worker as active for `trace_id`, creating the
    /// trace entry on first observation. Returns the token workers should
    /// select against.
    pub async fn enter(&self, trace_id: &str) -> CancellationToken {
        let mut guard = self.inner.write().await;
        let entry = guard
            .entry(trace_id.to_string())
            .or_insert_with(|| TraceEntry::new(now_secs()));
        entry.active_workers.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        entry.token.clone()
    }

    /// Mark a worker as no longer active for `trace_id`. If no worker
    /// remains, the entry is torn down.
    pub async fn leave(&self, trace_id: &str) {
        let mut guard = self.inner.write().await;
        let remove = if let Some(entry) = guard.get(trace_id) {
            let remaining = entry
                .active_workers
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
                - 1;
            remaining <= 0
        } else {
            false
        };
        if remove {
            guard.remove(trace_id);
        }
    }

    pub async fn is_cancelled(&self, trace_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(trace_id)
            .map(TraceEntry::is_cancelled)
            .unwrap_or(false)
    }

    /// Mark `trace_id` cancelled, cancelling every in-flight worker's token.
    /// Returns `true` if the trace was known (had at least one active
    /// worker or a live entry), `false` for an unknown or already-completed
    /// trace.
    pub async fn cancel(&self, trace_id: &str) -> bool {
        let guard = self.inner.read().await;
        match guard.get(trace_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_known(&self, trace_id: &str) -> bool {
        self.inner.read().await.contains_key(trace_id)
    }

    pub async fn active_trace_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Generate a fresh, time-ordered trace identifier. Callers that already
/// have a stable external request id should use that instead — `trace_id`
/// only needs to be unique per originating request, not necessarily
/// produced by this function.
pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trace_id_generates_distinct_values() {
        assert_ne!(new_trace_id(), new_trace_id());
    }

    #[tokio::test]
    async fn cancel_unknown_trace_returns_false() {
        let registry = TraceRegistry::new();
        assert!(!registry.cancel("nope").await);
    }

    #[tokio::test]
    async fn enter_then_cancel_returns_true_and_sets_token() {
        let registry = TraceRegistry::new();
        let token = registry.enter("t1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("t1").await);
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled("t1").await);
    }

    #[tokio::test]
    async fn leave_tears_down_entry_when_no_workers_remain() {
        let registry = TraceRegistry::new();
        registry.enter("t1").await;
        registry.enter("t1").await;
        assert!(registry.is_known("t1").await);
        registry.leave("t1").await;
        assert!(registry.is_known("t1").await);
        registry.leave("t1").await;
        assert!(!registry.is_known("t1").await);
    }

    #[tokio::test]
    async fn cancelling_a_completed_trace_is_a_no_op() {
        let registry = TraceRegistry::new();
        registry.enter("t1").await;
        registry.leave("t1").await;
        assert!(!registry.cancel("t1").await);
    }
}
