//! The eight-step worker lifecycle loop (spec §4.4): one long-lived task
//! per node that fetches, registers the trace, checks the deadline,
//! validates, invokes with retry/timeout, validates the output, routes,
//! and emits middleware events at every step.
//!
//! Grounded in the donor's `NodeEventLoop::next_event` select-race pattern
//! (`mofa-runtime/src/native_dataflow/node.rs`) for the fetch/cancel race,
//! and `MessageGraph`'s dispatch loop
//! (`mofa-kernel/src/message_graph/executor.rs`) for the
//! fetch-validate-invoke-route shape generalized with retry/backoff and
//! controller budgets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use flow_kernel::error::{FlowError, FlowErrorCode};
use flow_kernel::graph::{FanOutMode, NodeSpec};
use flow_kernel::payload::Payload;
use flow_kernel::stream::SeqAllocator;
use flow_kernel::trace::{now_secs, TraceRegistry};
use flow_kernel::Message;

use crate::budget_apply::{route_controller_output, ControllerRoute};
use crate::config::{ErrorRoutingMode, RuntimeConfig};
use crate::context::{ArtifactStore, Context};
use crate::middleware::{Event, EventKind, MiddlewareChain};
use crate::node::{NodeFailure, NodeFn, NodeOutcome};
use crate::queue::Edge;
use crate::state_store::{StateEvent, StateStore};

/// Everything a worker task needs to run one node for the runtime's
/// lifetime. Built once by `Runtime::run` and moved into the spawned task.
pub struct WorkerContext {
    pub spec: NodeSpec,
    pub func: Arc<dyn NodeFn>,
    pub in_edges: Vec<Arc<Edge>>,
    pub out_edges: HashMap<String, Arc<Edge>>,
    pub rookery: Arc<Edge>,
    pub trace_registry: TraceRegistry,
    pub middleware: Arc<MiddlewareChain>,
    pub config: Arc<RuntimeConfig>,
    pub state_store: Arc<dyn StateStore>,
    pub tool_context: Arc<Value>,
    pub artifact_store: Option<Arc<dyn ArtifactStore>>,
}

pub fn spawn_worker(wc: WorkerContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_worker(wc))
}

async fn run_worker(wc: WorkerContext) {
    let seq_alloc = Arc::new(Mutex::new(SeqAllocator::new()));
    let in_edges = Arc::new(wc.in_edges.clone());
    let out_edges = Arc::new(wc.out_edges.clone());

    loop {
        let message = match fetch_next(&wc.in_edges).await {
            Some(m) => m,
            None => break, // every in-edge closed; this worker is done
        };

        let token = wc.trace_registry.enter(&message.trace_id).await;
        if token.is_cancelled() {
            // Producer already released the queue slot; nothing to ack.
            wc.trace_registry.leave(&message.trace_id).await;
            continue;
        }

        if message.deadline_passed(now_secs()) {
            let out = deadline_exceeded_message(&wc.spec, &message);
            put_cancellable(&wc.rookery, out, &token).await.ok();
            wc.trace_registry.leave(&message.trace_id).await;
            continue;
        }

        if wc.spec.policy.validate.validates_input() {
            if let Err(err) = validate_message(&wc.spec, &message, false) {
                route_flow_error(&wc, err, &message, &token).await;
                wc.trace_registry.leave(&message.trace_id).await;
                continue;
            }
        }

        let outcome = {
            use tracing::Instrument;
            invoke_with_retries(&wc, &message, &token, &in_edges, &out_edges, &seq_alloc)
                .instrument(flow_kernel::telemetry::worker_span(&wc.spec.name))
                .await
        };

        match outcome {
            InvocationOutcome::Cancelled => {
                // No further messages for this trace from this worker.
            }
            InvocationOutcome::Paused(reason, payload, resume_token) => {
                let pause = Payload::Pause(flow_kernel::payload::Pause {
                    reason,
                    payload,
                    resume_token,
                });
                put_cancellable(&wc.rookery, message.with_payload(pause), &token)
                    .await
                    .ok();
            }
            InvocationOutcome::Error(err) => {
                route_flow_error(&wc, err, &message, &token).await;
            }
            InvocationOutcome::Routed => {
                // The node called `ctx.emit(...)` itself; nothing left to do.
            }
            InvocationOutcome::Emit(output) => {
                if wc.spec.policy.validate.validates_output() {
                    if let Err(err) = validate_message(&wc.spec, &output, true) {
                        route_flow_error(&wc, err, &message, &token).await;
                        wc.trace_registry.leave(&message.trace_id).await;
                        continue;
                    }
                }

                if wc.spec.allow_cycle {
                    match route_controller_output(output) {
                        ControllerRoute::Continue(m) => {
                            route_output(&wc, m, &token).await;
                        }
                        ControllerRoute::Terminate(m) => {
                            put_cancellable(&wc.rookery, m, &token).await.ok();
                        }
                    }
                } else {
                    route_output(&wc, output, &token).await;
                }
            }
        }

        wc.trace_registry.leave(&message.trace_id).await;
    }
}

/// Step 1: fetch the next message, either from the single declared
/// in-edge or, for a multi-input node such as `join_k`, multiplexed across
/// every declared in-edge (spec §4.4 step 1, §4.3).
async fn fetch_next(in_edges: &[Arc<Edge>]) -> Option<Message> {
    if in_edges.len() == 1 {
        return in_edges[0].get().await.ok();
    }
    let gets = in_edges.iter().map(|edge| Box::pin(edge.get()));
    let (result, _, _) = futures::future::select_all(gets).await;
    result.ok()
}

enum InvocationOutcome {
    Emit(Message),
    Routed,
    Error(FlowError),
    Paused(String, Value, String),
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn invoke_with_retries(
    wc: &WorkerContext,
    message: &Message,
    token: &CancellationToken,
    in_edges: &Arc<Vec<Arc<Edge>>>,
    out_edges: &Arc<HashMap<String, Arc<Edge>>>,
    seq_alloc: &Arc<Mutex<SeqAllocator>>,
) -> InvocationOutcome {
    let trace_id = message.trace_id.clone();
    let node_name = wc.spec.name.clone();
    let mut attempt: u32 = 0;

    loop {
        wc.middleware
            .dispatch(Event::new(
                EventKind::NodeStart,
                trace_id.clone(),
                node_name.clone(),
                attempt,
            ))
            .await;

        let started = Instant::now();
        let ctx = Context::new(
            Arc::from(node_name.as_str()),
            message.clone(),
            out_edges.clone(),
            wc.spec.policy.fan_out,
            in_edges.clone(),
            wc.rookery.clone(),
            token.clone(),
            seq_alloc.clone(),
            wc.tool_context.clone(),
            wc.artifact_store.clone(),
        );

        let span = flow_kernel::telemetry::invocation_span(&trace_id, &node_name, attempt);
        let call = {
            use tracing::Instrument;
            wc.func.call(message.clone(), ctx).instrument(span)
        };
        let timed = match wc.spec.policy.timeout_s {
            Some(secs) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Attempt::Cancelled,
                    res = tokio::time::timeout(Duration::from_secs_f64(secs), call) => match res {
                        Ok(outcome) => Attempt::Finished(outcome),
                        Err(_) => Attempt::TimedOut,
                    },
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Attempt::Cancelled,
                    outcome = call => Attempt::Finished(outcome),
                }
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match timed {
            Attempt::Finished(Ok(NodeOutcome::Emit(m))) => {
                wc.middleware
                    .dispatch(
                        Event::new(EventKind::NodeSuccess, trace_id, node_name, attempt)
                            .with_latency_ms(latency_ms),
                    )
                    .await;
                return InvocationOutcome::Emit(m);
            }
            Attempt::Finished(Ok(NodeOutcome::Routed)) => {
                wc.middleware
                    .dispatch(
                        Event::new(EventKind::NodeSuccess, trace_id, node_name, attempt)
                            .with_latency_ms(latency_ms),
                    )
                    .await;
                return InvocationOutcome::Routed;
            }
            Attempt::Finished(Err(NodeFailure::Pause(pause))) => {
                return InvocationOutcome::Paused(pause.reason, pause.payload, pause.resume_token);
            }
            Attempt::Finished(Err(NodeFailure::Error(err))) => {
                wc.middleware
                    .dispatch(
                        Event::new(
                            EventKind::NodeError,
                            trace_id.clone(),
                            node_name.clone(),
                            attempt,
                        )
                        .with_error(err.to_string()),
                    )
                    .await;
                if attempt < wc.spec.policy.max_retries {
                    wc.middleware
                        .dispatch(Event::new(
                            EventKind::NodeRetry,
                            trace_id.clone(),
                            node_name.clone(),
                            attempt,
                        ))
                        .await;
                    let delay = wc.spec.policy.backoff_delay(attempt);
                    if crate::retry::cancellable_backoff(Duration::from_secs_f64(delay), token)
                        .await
                        == crate::retry::WaitOutcome::Cancelled
                    {
                        wc.middleware
                            .dispatch(Event::new(
                                EventKind::NodeCancelled,
                                trace_id,
                                node_name,
                                attempt,
                            ))
                            .await;
                        return InvocationOutcome::Cancelled;
                    }
                    attempt += 1;
                    continue;
                }
                return InvocationOutcome::Error(FlowError::new(
                    FlowErrorCode::NodeException,
                    err.to_string(),
                    trace_id,
                    node_name,
                ));
            }
            Attempt::TimedOut => {
                wc.middleware
                    .dispatch(Event::new(
                        EventKind::NodeTimeout,
                        trace_id.clone(),
                        node_name.clone(),
                        attempt,
                    ))
                    .await;
                if attempt < wc.spec.policy.max_retries {
                    wc.middleware
                        .dispatch(Event::new(
                            EventKind::NodeRetry,
                            trace_id.clone(),
                            node_name.clone(),
                            attempt,
                        ))
                        .await;
                    let delay = wc.spec.policy.backoff_delay(attempt);
                    if crate::retry::cancellable_backoff(Duration::from_secs_f64(delay), token)
                        .await
                        == crate::retry::WaitOutcome::Cancelled
                    {
                        wc.middleware
                            .dispatch(Event::new(
                                EventKind::NodeCancelled,
                                trace_id,
                                node_name,
                                attempt,
                            ))
                            .await;
                        return InvocationOutcome::Cancelled;
                    }
                    attempt += 1;
                    continue;
                }
                return InvocationOutcome::Error(FlowError::new(
                    FlowErrorCode::Timeout,
                    format!("node `{node_name}` timed out after {attempt} retries"),
                    trace_id,
                    node_name,
                ));
            }
            Attempt::Cancelled => {
                wc.middleware
                    .dispatch(Event::new(
                        EventKind::NodeCancelled,
                        trace_id,
                        node_name,
                        attempt,
                    ))
                    .await;
                return InvocationOutcome::Cancelled;
            }
        }
    }
}

enum Attempt {
    Finished(Result<NodeOutcome, NodeFailure>),
    TimedOut,
    Cancelled,
}

fn validate_message(spec: &NodeSpec, message: &Message, is_output: bool) -> Result<(), FlowError> {
    let schema = if is_output {
        &spec.output_schema
    } else {
        &spec.input_schema
    };
    let Some(schema) = schema else {
        return Ok(());
    };
    let Payload::User(record) = &message.payload else {
        return Ok(());
    };
    schema.validate(&record.value).map_err(|msg| {
        FlowError::new(
            FlowErrorCode::Validation,
            msg,
            message.trace_id.clone(),
            spec.name.clone(),
        )
    })
}

fn deadline_exceeded_message(spec: &NodeSpec, message: &Message) -> Message {
    if message.payload.as_working_memory().is_some() {
        message.with_payload(flow_kernel::payload::FinalAnswer::new("Deadline exceeded"))
    } else {
        message.with_payload(FlowError::new(
            FlowErrorCode::DeadlineExceeded,
            "envelope deadline reached before dispatch",
            message.trace_id.clone(),
            spec.name.clone(),
        ))
    }
}

async fn route_flow_error(
    wc: &WorkerContext,
    err: FlowError,
    original: &Message,
    token: &CancellationToken,
) {
    wc.state_store
        .save_event(StateEvent {
            trace_id: original.trace_id.clone(),
            ts: now_secs(),
            kind: "node_error".to_string(),
            node_name: wc.spec.name.clone(),
            node_id: wc.spec.name.clone(),
            payload: HashMap::new(),
        })
        .await;

    let message = original.with_payload(err);
    match wc.config.error_routing {
        ErrorRoutingMode::Rookery | ErrorRoutingMode::RaiseAtFetch => {
            put_cancellable(&wc.rookery, message, token).await.ok();
        }
        ErrorRoutingMode::Payload => {
            route_output(wc, message, token).await;
        }
    }
}

/// Step 7 routing for a successful (or error-as-payload) output: wrap into
/// the node's successors, or the rookery if it has none.
async fn route_output(wc: &WorkerContext, message: Message, token: &CancellationToken) {
    if wc.out_edges.is_empty() {
        put_cancellable(&wc.rookery, message, token).await.ok();
        return;
    }

    let targets: Vec<Arc<Edge>> = if wc.out_edges.len() == 1 {
        wc.out_edges.values().cloned().collect()
    } else {
        match wc.spec.policy.fan_out {
            FanOutMode::Broadcast => wc.out_edges.values().cloned().collect(),
            FanOutMode::RequireTarget => {
                // The node should have routed explicitly via `ctx.emit`;
                // reaching here means it didn't. Surface it as a node
                // exception rather than silently dropping the message.
                let err = FlowError::new(
                    FlowErrorCode::NodeException,
                    format!(
                        "node `{}` has {} successors but returned a value instead of routing via ctx.emit",
                        wc.spec.name,
                        wc.out_edges.len()
                    ),
                    message.trace_id.clone(),
                    wc.spec.name.clone(),
                );
                let err_message = message.with_payload(err);
                put_cancellable(&wc.rookery, err_message, token).await.ok();
                return;
            }
        }
    };

    for edge in targets {
        put_cancellable(&edge, message.clone(), token).await.ok();
    }
}

async fn put_cancellable(
    edge: &Edge,
    message: Message,
    token: &CancellationToken,
) -> Result<(), ()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(()),
        result = edge.put(message) => result.map_err(|_| ()),
    }
}
