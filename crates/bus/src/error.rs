use thiserror::Error;

/// Errors raised by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing or binding against an exchange that was never declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consuming or binding a queue that was never declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// An exchange was redeclared with a different kind.
    #[error("Exchange {name} already declared as {existing}, not {requested}")]
    ExchangeKindMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    /// The broker did not confirm a publish.
    #[error("Publish to {exchange}/{routing_key} failed: {reason}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Ack/nack for a delivery the broker no longer tracks.
    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
