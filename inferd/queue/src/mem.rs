// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory stream backend with work-queue semantics.
//!
//! Deliveries move to a pending set until they are settled, so an unsettled
//! delivery is never lost within the process; cross-restart durability is
//! the business of broker-backed implementations of the same traits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::{Delivery, DurableQueue, QueueError, QueueResult, StreamSubscription};

#[derive(Default)]
struct StreamState {
    ready: Mutex<VecDeque<(u64, Bytes)>>,
    pending: Mutex<HashMap<u64, Bytes>>,
    notify: Notify,
}

impl StreamState {
    async fn push(&self, id: u64, payload: Bytes) {
        self.ready.lock().await.push_back((id, payload));
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Handle to an in-memory queue; clones share the same streams.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn stream(&self, name: &str) -> Arc<StreamState> {
        let mut streams = self.shared.streams.lock().await;
        streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(StreamState::default()))
            .clone()
    }

    /// Shut the queue down; subscribers drain to `None`.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let streams = self.shared.streams.lock().await;
        for stream in streams.values() {
            stream.notify.notify_waiters();
        }
    }

    /// Number of ready (not in-flight) messages on a stream.
    pub async fn ready_len(&self, name: &str) -> usize {
        self.stream(name).await.ready.lock().await.len()
    }

    /// Number of delivered but unsettled messages on a stream.
    pub async fn pending_len(&self, name: &str) -> usize {
        self.stream(name).await.pending.lock().await.len()
    }

    /// Snapshot of the ready payloads on a stream, in delivery order.
    pub async fn ready_payloads(&self, name: &str) -> Vec<Bytes> {
        self.stream(name)
            .await
            .ready
            .lock()
            .await
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    type Subscription = MemorySubscription;

    async fn publish(&self, stream: &str, payload: Bytes) -> QueueResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.stream(stream).await.push(id, payload).await;
        Ok(())
    }

    async fn subscribe(&self, stream: &str, consumer: &str) -> QueueResult<Self::Subscription> {
        tracing::debug!(stream, consumer, "subscribing consumer");
        Ok(MemorySubscription {
            stream: self.stream(stream).await,
            shared: self.shared.clone(),
        })
    }
}

pub struct MemorySubscription {
    stream: Arc<StreamState>,
    shared: Arc<Shared>,
}

#[async_trait]
impl StreamSubscription for MemorySubscription {
    type Delivery = MemoryDelivery;

    async fn next(&mut self) -> Option<Self::Delivery> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }

            let notified = self.stream.notify.notified();

            if let Some((id, payload)) = self.stream.ready.lock().await.pop_front() {
                self.stream.pending.lock().await.insert(id, payload.clone());
                return Some(MemoryDelivery {
                    id,
                    payload,
                    stream: self.stream.clone(),
                });
            }

            notified.await;
        }
    }
}

pub struct MemoryDelivery {
    id: u64,
    payload: Bytes,
    stream: Arc<StreamState>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &Bytes {
        &self.payload
    }

    async fn ack(self) -> QueueResult<()> {
        self.stream.pending.lock().await.remove(&self.id);
        Ok(())
    }

    async fn nack_with_delay(self, delay: Duration) -> QueueResult<()> {
        // Stays in the pending set until the delay elapses, so the message
        // counts as in-flight for the whole backoff.
        let stream = self.stream.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let payload = stream.pending.lock().await.remove(&id);
            if let Some(payload) = payload {
                stream.push(id, payload).await;
            }
        });
        Ok(())
    }

    async fn term(self) -> QueueResult<()> {
        self.stream.pending.lock().await.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use crate::mem::MemoryQueue;
    use crate::{Delivery, DurableQueue, StreamSubscription};

    #[tokio::test]
    async fn publish_deliver_ack() {
        let queue = MemoryQueue::new();
        queue.publish("s", Bytes::from_static(b"one")).await.unwrap();
        queue.publish("s", Bytes::from_static(b"two")).await.unwrap();

        let mut sub = queue.subscribe("s", "c").await.unwrap();

        let d = sub.next().await.unwrap();
        assert_eq!(d.payload().as_ref(), b"one");
        d.ack().await.unwrap();

        let d = sub.next().await.unwrap();
        assert_eq!(d.payload().as_ref(), b"two");
        d.ack().await.unwrap();

        assert_eq!(queue.ready_len("s").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_delay() {
        let queue = MemoryQueue::new();
        queue.publish("s", Bytes::from_static(b"retry")).await.unwrap();

        let mut sub = queue.subscribe("s", "c").await.unwrap();
        let d = sub.next().await.unwrap();
        d.nack_with_delay(Duration::from_secs(7)).await.unwrap();

        // Nothing ready before the delay has elapsed.
        tokio::task::yield_now().await;
        assert_eq!(queue.ready_len("s").await, 0);

        let d = sub.next().await.unwrap();
        assert_eq!(d.payload().as_ref(), b"retry");
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn term_drops_without_redelivery() {
        let queue = MemoryQueue::new();
        queue.publish("s", Bytes::from_static(b"poison")).await.unwrap();

        let mut sub = queue.subscribe("s", "c").await.unwrap();
        let d = sub.next().await.unwrap();
        d.term().await.unwrap();

        assert_eq!(queue.ready_len("s").await, 0);
        let stream = queue.stream("s").await;
        assert!(stream.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_drains_subscribers() {
        let queue = MemoryQueue::new();
        let mut sub = queue.subscribe("s", "c").await.unwrap();

        let waiter = tokio::spawn(async move { sub.next().await.is_none() });
        tokio::task::yield_now().await;

        queue.close().await;
        assert!(waiter.await.unwrap());
    }
}
