use bus::{Classify, ErrorClass};
use common::PaymentId;
use contracts::MalformedEvent;
use thiserror::Error;

use crate::PaymentStatus;

/// Errors raised while handling payment events.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The incoming message does not fit the event schema.
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    /// The charge was declined; the payment is now `Failed`.
    #[error("Payment {payment_id} declined: {reason}")]
    Declined {
        payment_id: PaymentId,
        reason: String,
    },

    /// The gateway did not answer in time; the payment is now `Failed`.
    #[error("Payment {0} timed out")]
    TimedOut(PaymentId),

    /// The gateway could not be reached. Retried.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// A payment referenced by our own event does not exist.
    #[error("Payment not found: {0}")]
    NotFound(PaymentId),

    /// A write asked for a move the state machine does not allow.
    #[error("Invalid payment transition from {from} to {to}")]
    InvalidStateTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// Stored data that cannot be interpreted.
    #[error("Corrupt payment state: {0}")]
    CorruptState(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An outgoing event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for PaymentError {
    fn class(&self) -> ErrorClass {
        match self {
            PaymentError::Malformed(_) => ErrorClass::MalformedEvent,
            PaymentError::Declined { .. } | PaymentError::TimedOut(_) => {
                ErrorClass::BusinessRejection
            }
            PaymentError::GatewayUnavailable(_) | PaymentError::Database(_) => {
                ErrorClass::TransientInfra
            }
            PaymentError::NotFound(_)
            | PaymentError::InvalidStateTransition { .. }
            | PaymentError::CorruptState(_)
            | PaymentError::Serialization(_) => ErrorClass::InvariantViolation,
        }
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
