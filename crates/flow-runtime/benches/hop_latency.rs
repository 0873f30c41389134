//! Single-hop latency under `criterion`, matching the donor workspace's own
//! `benches/` layout (Cargo-integrated `criterion` harness rather than a
//! hand-rolled timing loop). Measures the round trip of one message through
//! a single pass-through node: emit → worker fetch/invoke/route → fetch
//! from the rookery.

use criterion::{criterion_group, criterion_main, Criterion};
use flow_kernel::graph::NodeSpec;
use flow_kernel::payload::Payload;
use flow_kernel::Message;
use flow_runtime::node::{FnNode, Node, NodeOutcome};
use flow_runtime::runtime::{new_ingress_message, Runtime, RuntimeOptions};

fn single_hop(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("single_hop_emit_to_fetch", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let node = Node::new(
                    NodeSpec::new("echo"),
                    FnNode::new(|m: Message, _ctx| async move { Ok(NodeOutcome::Emit(m)) }),
                );
                let adjacency = node.to_egress();
                Runtime::create(vec![node], vec![adjacency], RuntimeOptions::new()).unwrap()
            },
            |runtime| async move {
                runtime.run().await.unwrap();
                runtime
                    .emit("echo", new_ingress_message(Payload::user(serde_json::json!("hop"))))
                    .await
                    .unwrap();
                let out = runtime.fetch().await.unwrap();
                runtime.stop().await.unwrap();
                out
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, single_hop);
criterion_main!(benches);
