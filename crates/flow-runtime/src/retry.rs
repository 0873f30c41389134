//! Cancellable backoff wait used between retry attempts (spec §4.4 step 5,
//! §5: "cancelling during a retry backoff wait aborts the wait
//! immediately"). The delay amount itself comes straight from
//! [`flow_kernel::graph::NodePolicy::backoff_delay`] — unlike the donor's
//! `RetryPolicy` enum (`mofa-runtime/src/retry.rs`), the spec fixes the
//! shape of the formula (`min(base * mult^attempt, max)`) as part of
//! `NodePolicy` itself, so there is no separate policy enum to choose
//! between here, only the cancellation race around `tokio::time::sleep`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Outcome of waiting out a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Cancelled,
}

/// Sleep for `delay`, racing the trace's cancellation token. Returns
/// immediately with [`WaitOutcome::Cancelled`] if the token fires mid-wait.
pub async fn cancellable_backoff(delay: Duration, token: &CancellationToken) -> WaitOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => WaitOutcome::Cancelled,
        _ = tokio::time::sleep(delay) => WaitOutcome::Completed,
    }
}
