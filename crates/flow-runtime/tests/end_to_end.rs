//! End-to-end scenarios exercising a running [`Runtime`] rather than any
//! single module in isolation: a multi-hop chain, fan-out/join, retry +
//! timeout overhead, a deadline short-circuit, a controller hop budget, and
//! cancellation isolation between two concurrent traces. Placed in `tests/`
//! per the donor workspace's convention of keeping whole-system behavior
//! out of `#[cfg(test)]` unit modules (see `mofa-runtime`'s own `tests/`
//! directory for multi-node dataflow scenarios).

use std::time::Duration;

use flow_kernel::graph::{Adjacency, FanOutMode, NodePolicy, NodeSpec};
use flow_kernel::payload::{FinalAnswer, Payload, WorkingMemory};
use flow_kernel::Message;
use flow_runtime::node::{FnNode, Node, NodeOutcome};
use flow_runtime::patterns::join_k;
use flow_runtime::runtime::{new_ingress_message, Runtime, RuntimeOptions};
use flow_runtime::testkit::{CapturingMiddleware, FlakyNode};

fn passthrough(name: &str) -> Node {
    Node::new(
        NodeSpec::new(name),
        FnNode::new(|m: Message, _ctx| async move { Ok(NodeOutcome::Emit(m)) }),
    )
}

#[tokio::test]
async fn hop_latency_through_a_five_node_chain() {
    let names = ["a", "b", "c", "d", "e"];
    let nodes: Vec<Node> = names.iter().map(|n| passthrough(n)).collect();
    let mut adjacencies = Vec::new();
    for pair in nodes.windows(2) {
        adjacencies.push(pair[0].to(&[&pair[1]]));
    }
    adjacencies.push(nodes.last().unwrap().to_egress());

    let runtime = Runtime::create(nodes, adjacencies, RuntimeOptions::new()).unwrap();
    runtime.run().await.unwrap();

    let msg = new_ingress_message(Payload::user(serde_json::json!("start")));
    let trace_id = msg.trace_id.clone();
    runtime.emit("a", msg).await.unwrap();

    let out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .expect("chain should deliver within 2s")
        .unwrap();
    assert_eq!(out.trace_id, trace_id);
    assert_eq!(out.payload, Payload::user(serde_json::json!("start")));

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn fan_out_then_join_combines_every_branch() {
    let source = Node::new(
        NodeSpec::new("source").with_policy(NodePolicy::builder().broadcast().build()),
        FnNode::new(|m: Message, ctx| async move {
            ctx.emit(m, None).await.map_err(|e| {
                flow_runtime::node::NodeFailure::Error(flow_runtime::node::NodeError::new(e))
            })?;
            Ok(NodeOutcome::Routed)
        }),
    );
    let left = Node::new(
        NodeSpec::new("left"),
        FnNode::new(|m: Message, _ctx| async move {
            Ok(NodeOutcome::Emit(
                m.with_payload(Payload::user(serde_json::json!("left"))),
            ))
        }),
    );
    let right = Node::new(
        NodeSpec::new("right"),
        FnNode::new(|m: Message, _ctx| async move {
            Ok(NodeOutcome::Emit(
                m.with_payload(Payload::user(serde_json::json!("right"))),
            ))
        }),
    );
    let join = join_k("join", 2);

    let adjacencies = vec![
        source.to(&[&left, &right]),
        left.to(&[&join]),
        right.to(&[&join]),
        join.to_egress(),
    ];

    let runtime = Runtime::create(
        vec![source, left, right, join],
        adjacencies,
        RuntimeOptions::new(),
    )
    .unwrap();
    runtime.run().await.unwrap();

    runtime
        .emit(
            "source",
            new_ingress_message(Payload::user(serde_json::json!("go"))),
        )
        .await
        .unwrap();

    let out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .unwrap()
        .unwrap();
    let Payload::User(record) = out.payload else {
        panic!("expected a user payload");
    };
    let mut parts: Vec<String> = record
        .value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    parts.sort();
    assert_eq!(parts, vec!["left".to_string(), "right".to_string()]);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn fan_out_join_then_stream_summarize_delivers_three_ordered_chunks() {
    // Spec scenario 2 (spec.md §8): ingress -> fan -> 3 parallel branches ->
    // join_k(k=3) -> summarize, where `summarize` is an egress node that
    // streams its combined input as StreamChunks rather than returning a
    // single aggregate payload.
    let fan = Node::new(
        NodeSpec::new("fan").with_policy(NodePolicy::builder().broadcast().build()),
        FnNode::new(|m: Message, ctx| async move {
            ctx.emit(m, None).await.map_err(|e| {
                flow_runtime::node::NodeFailure::Error(flow_runtime::node::NodeError::new(e))
            })?;
            Ok(NodeOutcome::Routed)
        }),
    );
    let branch = |name: &str, suffix: &'static str| {
        Node::new(
            NodeSpec::new(name),
            FnNode::new(move |m: Message, _ctx| async move {
                let Payload::User(record) = &m.payload else {
                    return Ok(NodeOutcome::Emit(m));
                };
                let text = record.value.as_str().unwrap_or_default();
                Ok(NodeOutcome::Emit(
                    m.with_payload(Payload::user(serde_json::json!(format!("{text}::{suffix}")))),
                ))
            }),
        )
    };
    let a = branch("a", "A");
    let b = branch("b", "B");
    let c = branch("c", "C");
    let join = join_k("join", 3);
    let summarize = Node::new(
        NodeSpec::new("summarize"),
        FnNode::new(|m: Message, ctx| async move {
            let Payload::User(record) = &m.payload else {
                return Ok(NodeOutcome::Emit(m));
            };
            let parts = record.value.as_array().cloned().unwrap_or_default();
            let last = parts.len().saturating_sub(1);
            for (seq, part) in parts.iter().enumerate() {
                let text = part.as_str().unwrap_or_default();
                ctx.emit_chunk(&m, text, m.trace_id.clone(), seq == last, None, Some(seq as u64))
                    .await
                    .map_err(|e| {
                        flow_runtime::node::NodeFailure::Error(flow_runtime::node::NodeError::new(e))
                    })?;
            }
            Ok(NodeOutcome::Routed)
        }),
    );

    let adjacencies = vec![
        fan.to(&[&a, &b, &c]),
        a.to(&[&join]),
        b.to(&[&join]),
        c.to(&[&join]),
        join.to(&[&summarize]),
        summarize.to_egress(),
    ];

    let runtime = Runtime::create(
        vec![fan, a, b, c, join, summarize],
        adjacencies,
        RuntimeOptions::new(),
    )
    .unwrap();
    runtime.run().await.unwrap();

    let msg = new_ingress_message(Payload::user(serde_json::json!("msg-0")));
    let trace_id = msg.trace_id.clone();
    runtime.emit("fan", msg).await.unwrap();

    let mut chunks = Vec::new();
    for _ in 0..3 {
        let out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
            .await
            .expect("summarize should stream a chunk per branch")
            .unwrap();
        assert_eq!(out.trace_id, trace_id);
        chunks.push(out);
    }

    flow_runtime::testkit::assert_stream_well_ordered(&chunks);

    let mut texts: Vec<String> = chunks
        .iter()
        .map(|m| {
            let Payload::Chunk(chunk) = &m.payload else {
                panic!("expected a StreamChunk payload");
            };
            chunk.text.clone()
        })
        .collect();
    texts.sort();
    assert_eq!(
        texts,
        vec![
            "msg-0::A".to_string(),
            "msg-0::B".to_string(),
            "msg-0::C".to_string(),
        ]
    );

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn retry_then_timeout_overhead_is_observable_via_middleware() {
    let policy = NodePolicy::builder()
        .max_retries(3)
        .backoff(0.001, 1.0, 0.005)
        .build();
    let node = Node::new(
        NodeSpec::new("flaky").with_policy(policy),
        FlakyNode::fail_then_succeed(2),
    );
    let adjacency = Adjacency::new("flaky", Vec::<String>::new());

    let runtime = Runtime::create(vec![node], vec![adjacency], RuntimeOptions::new()).unwrap();
    let capture = CapturingMiddleware::new();
    runtime.add_middleware(Box::new(capture.clone())).await;
    runtime.run().await.unwrap();

    runtime
        .emit(
            "flaky",
            new_ingress_message(Payload::user(serde_json::json!("go"))),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(capture.count_kind("node_error").await, 2);
    assert_eq!(capture.count_kind("node_retry").await, 2);
    assert_eq!(capture.count_kind("node_success").await, 1);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn a_message_past_its_deadline_short_circuits_before_dispatch() {
    let node = passthrough("slow");
    let adjacency = node.to_egress();
    let runtime = Runtime::create(vec![node], vec![adjacency], RuntimeOptions::new()).unwrap();
    runtime.run().await.unwrap();

    let msg = new_ingress_message(Payload::user(serde_json::json!("late"))).with_deadline_s(0.0);
    runtime.emit("slow", msg).await.unwrap();

    let out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .unwrap()
        .unwrap();
    let err = out.payload.as_error().expect("expected a FlowError payload");
    assert_eq!(err.code, flow_kernel::error::FlowErrorCode::DeadlineExceeded);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn controller_hop_budget_terminates_into_a_final_answer() {
    // A self-looping node is never classified as ingress (it always has
    // itself as a predecessor), so a separate `entry` node injects the
    // first working-memory message before `controller` takes over the
    // back-edge.
    let entry = passthrough("entry");
    let controller = Node::new(
        NodeSpec::new("controller").allow_cycle(),
        FnNode::new(|m: Message, _ctx| async move {
            let wm = m.payload.as_working_memory().cloned().unwrap();
            Ok(NodeOutcome::Emit(m.with_payload(wm)))
        }),
    );
    let adjacencies = vec![
        entry.to(&[&controller]),
        Adjacency::new("controller", vec!["controller"]),
    ];

    let runtime =
        Runtime::create(vec![entry, controller], adjacencies, RuntimeOptions::new()).unwrap();
    runtime.run().await.unwrap();

    let wm = WorkingMemory::new("q", 2, 1_000_000);
    runtime
        .emit("entry", new_ingress_message(Payload::WorkingMemory(wm)))
        .await
        .unwrap();

    let out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .expect("budget exhaustion should terminate into the rookery")
        .unwrap();
    let answer: FinalAnswer = out
        .payload
        .as_final_answer()
        .cloned()
        .expect("expected a FinalAnswer payload");
    assert_eq!(answer.text, "Hop budget exhausted");

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn cancelling_one_trace_does_not_affect_a_concurrent_sibling() {
    // Two disconnected single-node components sharing one runtime: each
    // gets its own worker task, so a trace hung on `watcher` runs truly
    // concurrently with — and independently of — a trace completing on
    // `worker` (spec §5: cancellation is per-trace, not global).
    let watcher = Node::new(
        NodeSpec::new("watcher"),
        FnNode::new(|m: Message, ctx| async move {
            while !ctx.check_cancel() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(NodeOutcome::Emit(m))
        }),
    );
    let worker = passthrough("worker");
    let adjacencies = vec![watcher.to_egress(), worker.to_egress()];

    let runtime =
        Runtime::create(vec![watcher, worker], adjacencies, RuntimeOptions::new()).unwrap();
    runtime.run().await.unwrap();

    let hung_msg = new_ingress_message(Payload::user(serde_json::json!("hang")));
    let hung_trace = hung_msg.trace_id.clone();
    runtime.emit("watcher", hung_msg).await.unwrap();

    // Give the watcher worker a beat to register its trace.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!runtime.cancel("not-a-real-trace").await);

    let sibling_msg = new_ingress_message(Payload::user(serde_json::json!("sibling")));
    let sibling_trace = sibling_msg.trace_id.clone();
    runtime.emit("worker", sibling_msg).await.unwrap();

    let sibling_out = tokio::time::timeout(Duration::from_secs(2), runtime.fetch())
        .await
        .expect("sibling trace must complete while the other trace is still hung")
        .unwrap();
    assert_eq!(sibling_out.trace_id, sibling_trace);

    assert!(runtime.cancel(&hung_trace).await);

    runtime.stop().await.unwrap();
}
