use thiserror::Error;
use uuid::Uuid;

/// Errors raised by outbox storage and the relay.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// No outbox row with this id.
    #[error("Outbox message not found: {0}")]
    NotFound(Uuid),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
