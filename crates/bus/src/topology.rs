//! Exchange, queues and bindings of the saga.

use contracts::topics;

use crate::{ExchangeKind, MessageBus, QueueSpec, Result};

/// Queue consumed by the payment participant.
pub const PAYMENT_QUEUE: &str = "payment_events";

/// Queue consumed by the stock participant.
pub const STOCK_QUEUE: &str = "stock_events";

/// Queue consumed by the order participant.
pub const ORDER_QUEUE: &str = "order_events";

/// A queue and the routing keys it is bound with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: QueueSpec,
    pub routing_keys: Vec<String>,
}

impl QueueBinding {
    pub fn new(queue: &str, routing_keys: &[&str]) -> Self {
        Self {
            queue: QueueSpec::durable(queue),
            routing_keys: routing_keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// The broker objects the saga relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queues: Vec<QueueBinding>,
}

impl Topology {
    /// One topic exchange, one durable queue per participant.
    pub fn saga() -> Self {
        Self {
            exchange: topics::SAGA_EXCHANGE.to_string(),
            kind: ExchangeKind::Topic,
            queues: vec![
                QueueBinding::new(
                    PAYMENT_QUEUE,
                    &[
                        topics::ORDER_CREATED,
                        topics::PAYMENT_REQUESTED,
                        topics::STOCK_RESERVATION_FAILED,
                    ],
                ),
                QueueBinding::new(
                    STOCK_QUEUE,
                    &[topics::PAYMENT_PROCESSED, topics::ORDER_CANCELLED],
                ),
                QueueBinding::new(
                    ORDER_QUEUE,
                    &[
                        topics::STOCK_RESERVED,
                        topics::STOCK_RESERVATION_FAILED,
                        topics::PAYMENT_FAILED,
                    ],
                ),
            ],
        }
    }

    /// Declares everything. Safe to call from every process on every start.
    #[tracing::instrument(skip(self, bus), fields(exchange = %self.exchange))]
    pub async fn declare<B: MessageBus + ?Sized>(&self, bus: &B) -> Result<()> {
        bus.declare_exchange(&self.exchange, self.kind).await?;
        for binding in &self.queues {
            bus.declare_queue(&binding.queue).await?;
            for key in &binding.routing_keys {
                bus.bind_queue(&binding.queue.name, &self.exchange, key)
                    .await?;
            }
        }
        tracing::info!(queues = self.queues.len(), "topology declared");
        Ok(())
    }

    /// Looks up a queue binding by queue name.
    pub fn queue(&self, name: &str) -> Option<&QueueBinding> {
        self.queues.iter().find(|b| b.queue.name == name)
    }
}
