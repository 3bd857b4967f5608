// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable stream abstraction: named streams with durable consumers,
//! at-least-once delivery, manual acknowledgement, negative acknowledgement
//! with a redelivery delay, and poison termination.
//!
//! The transaction manager holds only a publish/subscribe handle to this
//! interface; it does not own the queue. Any broker with these semantics
//! can implement the traits; the crate ships an in-memory backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// In-memory queue backend.
#[cfg(feature = "inmem")]
pub mod mem;

/// Possible errors during stream operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("the queue has been shut down")]
    Closed,
    #[error("unexpected error: {0}")]
    Unexpected(Box<dyn std::error::Error + Send + Sync>),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Publish/subscribe handle over named durable streams.
#[async_trait]
pub trait DurableQueue: Clone + Send + Sync + 'static {
    type Subscription: StreamSubscription;

    /// Append a payload to the stream, creating the stream on first use.
    async fn publish(&self, stream: &str, payload: Bytes) -> QueueResult<()>;

    /// Attach a durable named consumer to the stream.
    ///
    /// Deliveries not acknowledged by the consumer are redelivered.
    async fn subscribe(&self, stream: &str, consumer: &str) -> QueueResult<Self::Subscription>;
}

/// A durable consumer's view of one stream.
#[async_trait]
pub trait StreamSubscription: Send {
    type Delivery: Delivery;

    /// Wait for the next delivery. `None` when the queue shuts down.
    async fn next(&mut self) -> Option<Self::Delivery>;
}

/// One in-flight delivery which must be settled exactly one way.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &Bytes;

    /// The work is done; never deliver again.
    async fn ack(self) -> QueueResult<()>;

    /// The work failed transiently; redeliver after the delay.
    async fn nack_with_delay(self, delay: Duration) -> QueueResult<()>;

    /// The payload is poison; drop it without redelivery.
    async fn term(self) -> QueueResult<()>;
}
