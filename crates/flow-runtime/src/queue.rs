//! The bounded FIFO edge (spec §4.2): `put` suspends the producer when full,
//! `get` suspends the consumer when empty. Safe for exactly one producer
//! task and one consumer task per edge, matching the topology invariant
//! that fan-out is modeled as multiple edges from the same producer.
//!
//! Specialized from the donor bus's `EventQueue`
//! (`mofa-kernel/src/bus/queue.rs`, `Mutex<VecDeque>` + `Notify` +
//! `Semaphore`) down to the single blocking strategy the spec requires —
//! the donor's `DropOldest`/`DropLowPriority` strategies have no
//! counterpart here since backpressure, not shedding, is the spec's only
//! flow-control mechanism (§5, §9).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, Semaphore};

use flow_kernel::Message;

/// A bounded FIFO queue between one producer and one consumer.
pub struct Edge {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    semaphore: Semaphore,
    capacity: usize,
    closed: AtomicBool,
}

/// Returned by [`Edge::get`] when the edge has been closed and drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl Edge {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            semaphore: Semaphore::new(capacity),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue `item`, suspending the caller while the edge is full. Returns
    /// `Err(Closed)` immediately if the edge has already been closed.
    pub async fn put(&self, item: Message) -> Result<(), Closed> {
        if self.is_closed() {
            return Err(Closed);
        }
        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(Closed),
        };
        permit.forget();
        if self.is_closed() {
            // Closed while we were waiting for capacity; don't enqueue
            // behind consumers that have already exited.
            self.semaphore.add_permits(1);
            return Err(Closed);
        }
        {
            let mut guard = self.queue.lock().await;
            guard.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next item, suspending the caller while the edge is
    /// empty. Returns `Err(Closed)` once the edge is closed and fully
    /// drained.
    pub async fn get(&self) -> Result<Message, Closed> {
        loop {
            // Register for notification before checking, so a `put` that
            // races in between cannot be missed (notified-before-check).
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut guard = self.queue.lock().await;
                if let Some(item) = guard.pop_front() {
                    drop(guard);
                    self.semaphore.add_permits(1);
                    return Ok(item);
                }
            }

            if self.is_closed() {
                let mut guard = self.queue.lock().await;
                if let Some(item) = guard.pop_front() {
                    drop(guard);
                    self.semaphore.add_permits(1);
                    return Ok(item);
                }
                return Err(Closed);
            }

            notified.await;
        }
    }

    /// Close the edge: pending and future `get` calls drain whatever is
    /// queued, then return `Err(Closed)`; pending `put` calls fail
    /// immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_kernel::payload::Payload;
    use std::time::Duration;

    fn msg(text: &str) -> Message {
        Message::new("t1", Payload::user(serde_json::json!(text)))
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let edge = Edge::new(8);
        edge.put(msg("a")).await.unwrap();
        edge.put(msg("b")).await.unwrap();
        edge.put(msg("c")).await.unwrap();

        let got_a = edge.get().await.unwrap();
        let got_b = edge.get().await.unwrap();
        let got_c = edge.get().await.unwrap();
        assert_eq!(got_a.payload, Payload::user(serde_json::json!("a")));
        assert_eq!(got_b.payload, Payload::user(serde_json::json!("b")));
        assert_eq!(got_c.payload, Payload::user(serde_json::json!("c")));
    }

    #[tokio::test]
    async fn put_blocks_when_full_and_resumes_on_dequeue() {
        let edge = Edge::new(1);
        edge.put(msg("a")).await.unwrap();

        let edge2 = edge.clone();
        let handle = tokio::spawn(async move {
            edge2.put(msg("b")).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let first = edge.get().await.unwrap();
        assert_eq!(first.payload, Payload::user(serde_json::json!("a")));

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("put should have unblocked")
            .unwrap();
    }

    #[tokio::test]
    async fn get_blocks_when_empty_and_resumes_on_enqueue() {
        let edge = Edge::new(4);
        let edge2 = edge.clone();
        let handle = tokio::spawn(async move { edge2.get().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        edge.put(msg("late")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("get should have unblocked")
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, Payload::user(serde_json::json!("late")));
    }

    #[tokio::test]
    async fn close_drains_then_returns_closed() {
        let edge = Edge::new(4);
        edge.put(msg("a")).await.unwrap();
        edge.close();

        let drained = edge.get().await.unwrap();
        assert_eq!(drained.payload, Payload::user(serde_json::json!("a")));
        assert_eq!(edge.get().await, Err(Closed));
    }

    #[tokio::test]
    async fn put_after_close_fails_immediately() {
        let edge = Edge::new(4);
        edge.close();
        assert_eq!(edge.put(msg("x")).await, Err(Closed));
    }
}
