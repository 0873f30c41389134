//! The pluggable replay/state-store hook (spec §4.9): an optional object
//! the runtime calls fire-and-forget, never blocking flow execution on its
//! failures. Grounded in the donor kernel's fire-and-forget persistence
//! callbacks used by the secretary/monitoring subsystem
//! (`mofa-foundation/src/secretary/monitoring/*`) — failures are logged at
//! the call site, not propagated, matching spec §7: "State-store failures
//! never propagate — they are logged and swallowed."

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// `{trace_id, ts, kind, node_name, node_id, payload}` (spec §6) — the
/// core's own instrumentation event shape. `payload` stays a JSON map since
/// it is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub trace_id: String,
    pub ts: f64,
    pub kind: String,
    pub node_name: String,
    pub node_id: String,
    pub payload: HashMap<String, Value>,
}

/// Persisted once a `RemoteNode` collaborator binds a trace to a remote
/// call (spec §4.9, §6). The core never interprets the contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBinding {
    pub trace_id: String,
    pub node_name: String,
    pub remote_id: String,
    pub metadata: HashMap<String, Value>,
}

/// Planner-layer memory snapshot, saved/loaded through the same hook the
/// core's own `save_event`/`save_remote_binding` use, but never touched by
/// the core itself (spec §4.9: "used by planner memory").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    pub trace_id: String,
    pub data: Value,
}

/// Optional async persistence hook (spec §4.9). The core calls only
/// `save_event` (for its own instrumentation, if enabled) and
/// `save_remote_binding` (from a remote-call node); `load_history` and the
/// memory methods exist for planner-layer collaborators.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_event(&self, event: StateEvent);
    async fn load_history(&self, trace_id: &str) -> Vec<StateEvent>;
    async fn save_remote_binding(&self, binding: RemoteBinding);
    async fn save_memory_state(&self, _state: MemoryState) {}
    async fn load_memory_state(&self, _trace_id: &str) -> Option<MemoryState> {
        None
    }
}

/// The default store: every call is a no-op. Used when `create(...)` is
/// not given a `state_store`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateStore;

#[async_trait]
impl StateStore for NullStateStore {
    async fn save_event(&self, _event: StateEvent) {}
    async fn load_history(&self, _trace_id: &str) -> Vec<StateEvent> {
        Vec::new()
    }
    async fn save_remote_binding(&self, _binding: RemoteBinding) {}
}

/// An in-memory store useful for tests and the testkit's deterministic
/// runners — keeps every event and binding it is given, keyed by
/// `trace_id` for `load_history`.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    events: RwLock<Vec<StateEvent>>,
    bindings: RwLock<Vec<RemoteBinding>>,
    memory: RwLock<HashMap<String, MemoryState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn all_bindings(&self) -> Vec<RemoteBinding> {
        self.bindings.read().await.clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_event(&self, event: StateEvent) {
        self.events.write().await.push(event);
    }

    async fn load_history(&self, trace_id: &str) -> Vec<StateEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect()
    }

    async fn save_remote_binding(&self, binding: RemoteBinding) {
        self.bindings.write().await.push(binding);
    }

    async fn save_memory_state(&self, state: MemoryState) {
        self.memory.write().await.insert(state.trace_id.clone(), state);
    }

    async fn load_memory_state(&self, trace_id: &str) -> Option<MemoryState> {
        self.memory.read().await.get(trace_id).cloned()
    }
}

/// Call `store.save_event(event)`, logging (rather than propagating) any
/// failure the store's own code might later be extended to surface. The
/// trait above can't fail today, but every call site is funneled through
/// here so that guarantee is centralized, not re-derived ad hoc at each
/// call site.
pub async fn record_event(store: &dyn StateStore, event: StateEvent) {
    store.save_event(event).await;
}
