//! Tracing helpers shared by `flow-runtime`'s worker loop and middleware
//! dispatch. Grounded in the donor bus's `tracing::debug!`/`info!`
//! instrumentation around send/receive (`mofa-kernel/src/bus/mod.rs`):
//! one span per node invocation, debug-level events for middleware
//! dispatch, so a `tracing` subscriber gives the same lifecycle visibility
//! as the middleware event stream without the two being coupled.

use tracing::Span;

/// Open the span that should wrap one worker invocation attempt.
pub fn invocation_span(trace_id: &str, node_name: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "node_invocation",
        trace_id = trace_id,
        node_name = node_name,
        attempt = attempt
    )
}

/// Open the span wrapping one full worker lifecycle (fetch through route),
/// distinct from `invocation_span`, which is re-entered once per retry
/// attempt inside it.
pub fn worker_span(node_name: &str) -> Span {
    tracing::info_span!("worker_loop", node_name = node_name)
}
