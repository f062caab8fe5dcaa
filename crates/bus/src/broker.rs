//! The broker seam.

use async_trait::async_trait;

use crate::{Delivery, ExchangeKind, Message, QueueSpec, Result};

/// A message broker with exchanges, queues and bindings.
///
/// Declarations are idempotent: declaring the same exchange, queue or binding
/// again is a no-op, so every participant can declare its topology on every
/// startup. `publish` returns only after the broker has accepted the message.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// The consumer type handed out by [`MessageBus::consume`].
    type Consumer: Consumer + 'static;

    /// Declares an exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declares a queue (and its dead-letter queue when requested).
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Binds a queue to an exchange with a binding key.
    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Publishes a message; Ok means the broker confirmed it.
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()>;

    /// Starts consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Self::Consumer>;
}

/// A subscription to one queue with manual acknowledgement.
///
/// Deliveries not acknowledged before the consumer is cancelled or dropped go
/// back to the queue.
#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery; `None` once the consumer is closed.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn next(&mut self) -> Option<Delivery>;

    /// Removes the message from the queue.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Returns the message to the head of the queue for redelivery.
    async fn requeue(&mut self, delivery: &Delivery) -> Result<()>;

    /// Moves the message to the queue's dead-letter queue.
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Unsubscribes, returning unacknowledged deliveries to the queue.
    async fn cancel(&mut self);
}
