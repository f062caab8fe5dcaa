//! Messages, deliveries and queue declarations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Header set on dead-lettered messages with the reason they were rejected.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

/// Header set on dead-lettered messages naming the queue they came from.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

/// Exchange routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key matched against binding patterns (`*`, `#`).
    Topic,
    /// Routing key must equal the binding key.
    Direct,
    /// Every bound queue receives every message.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Also declare `<name>.dead-letter` and route rejected messages there.
    pub dead_letter: bool,
}

impl QueueSpec {
    /// A durable queue with a dead-letter queue, the shape every saga
    /// participant uses.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: true,
        }
    }

    /// Name of the dead-letter queue paired with `queue`.
    pub fn dead_letter_name(queue: &str) -> String {
        format!("{queue}.dead-letter")
    }
}

/// A message as published to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Producer-assigned id; the saga uses the event id.
    pub message_id: String,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// A JSON message with the given id.
    pub fn json(message_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            content_type: "application/json".to_string(),
            headers: BTreeMap::new(),
            body,
            published_at: Utc::now(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag, unique per queue.
    pub tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
    /// 1 on first delivery, incremented on every requeue.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    /// True if this message was delivered before and requeued.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}
