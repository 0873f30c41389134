//! Middleware: an observer callback invoked on node lifecycle events,
//! advisory only (spec §4.5, §6, §9).
//!
//! Kept as a simple `Vec` of callbacks invoked in registration order, each
//! under a `catch_unwind`-equivalent (an error from a callback is logged
//! and swallowed) — "do not build a plugin system" (spec §9). Ordering
//! across events for the same node invocation is `start < (retry|timeout|
//! error)* < (success|cancelled|final_error)`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

/// Canonical middleware event names (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeStart,
    NodeSuccess,
    NodeError,
    NodeRetry,
    NodeTimeout,
    NodeCancelled,
    TraceCancelStart,
    TraceCancelFinish,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeStart => "node_start",
            EventKind::NodeSuccess => "node_success",
            EventKind::NodeError => "node_error",
            EventKind::NodeRetry => "node_retry",
            EventKind::NodeTimeout => "node_timeout",
            EventKind::NodeCancelled => "node_cancelled",
            EventKind::TraceCancelStart => "trace_cancel_start",
            EventKind::TraceCancelFinish => "trace_cancel_finish",
        }
    }
}

/// One middleware observation. Carries at minimum `{event, ts, trace_id,
/// node_name, attempt, latency_ms?, error?}` (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: &'static str,
    pub ts: f64,
    pub trace_id: String,
    pub node_name: String,
    pub attempt: u32,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, trace_id: impl Into<String>, node_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            event: kind.as_str(),
            ts: flow_kernel::trace::now_secs(),
            trace_id: trace_id.into(),
            node_name: node_name.into(),
            attempt,
            latency_ms: None,
            error: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_latency_ms(mut self, ms: f64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// An async observer callback registered with a [`crate::runtime::Runtime`].
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// A plain async-fn middleware adapter, for callers who don't want to
/// implement the trait by hand.
pub struct FnMiddleware<F>(pub F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&Event) + Send + Sync,
{
    async fn on_event(&self, event: &Event) {
        (self.0)(event);
    }
}

/// The append-only list of registered middleware, dispatched in
/// registration order. A middleware that panics or whose future fails is
/// logged and does not prevent the remaining middleware from observing the
/// same event.
///
/// Wrapped in a `tokio::sync::RwLock` rather than taking `&mut self` so a
/// [`crate::runtime::Runtime`] can share one chain across every worker task
/// while still allowing `add_middleware` to register new observers after
/// startup (spec §4.5: "register an async callback").
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: tokio::sync::RwLock<Vec<Box<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, middleware: Box<dyn Middleware>) {
        self.middlewares.write().await.push(middleware);
    }

    pub async fn dispatch(&self, event: Event) {
        let guard = self.middlewares.read().await;
        for mw in guard.iter() {
            let outcome = AssertUnwindSafe(mw.on_event(&event)).catch_unwind().await;
            if outcome.is_err() {
                tracing::warn!(
                    event = event.event,
                    node_name = %event.node_name,
                    "middleware panicked while handling event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Middleware for Counting {
        async fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl Middleware for Panicking {
        async fn on_event(&self, _event: &Event) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn a_panicking_middleware_does_not_block_later_ones() {
        let count = Arc::new(AtomicUsize::new(0));
        let chain = MiddlewareChain::new();
        chain.register(Box::new(Panicking)).await;
        chain.register(Box::new(Counting(count.clone()))).await;

        chain
            .dispatch(Event::new(EventKind::NodeSuccess, "t1", "n1", 0))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middlewares_dispatch_in_registration_order() {
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        struct Recording(Arc<tokio::sync::Mutex<Vec<u8>>>, u8);
        #[async_trait]
        impl Middleware for Recording {
            async fn on_event(&self, _event: &Event) {
                self.0.lock().await.push(self.1);
            }
        }

        let chain = MiddlewareChain::new();
        chain.register(Box::new(Recording(order.clone(), 1))).await;
        chain.register(Box::new(Recording(order.clone(), 2))).await;
        chain.register(Box::new(Recording(order.clone(), 3))).await;

        chain
            .dispatch(Event::new(EventKind::NodeStart, "t1", "n1", 0))
            .await;

        assert_eq!(*order.lock().await, vec![1, 2, 3]);
    }
}
