use bus::{Classify, ErrorClass};
use common::{Money, OrderId, ProductId};
use contracts::MalformedEvent;
use thiserror::Error;

use crate::OrderStatus;

/// Errors raised while placing orders or handling order events.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The incoming message does not fit the event schema.
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    /// Customer ID is required.
    #[error("Customer ID is required")]
    CustomerIdRequired,

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Invalid quantity.
    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    /// Invalid price.
    #[error("Invalid price for {product_id}: {price} (must be greater than 0)")]
    InvalidPrice { product_id: ProductId, price: Money },

    /// The order total does not fit in the amount range.
    #[error("Order total overflows")]
    TotalOverflow,

    /// An order with this id already exists.
    #[error("Order already exists: {0}")]
    AlreadyExists(OrderId),

    /// An event refers to an order this service never placed.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// A write asked for a move the state machine does not allow.
    #[error("Invalid order transition from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    /// Stored data that cannot be interpreted.
    #[error("Corrupt order state: {0}")]
    CorruptState(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An outgoing event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for OrderError {
    fn class(&self) -> ErrorClass {
        match self {
            OrderError::Malformed(_) => ErrorClass::MalformedEvent,
            OrderError::CustomerIdRequired
            | OrderError::NoItems
            | OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. }
            | OrderError::TotalOverflow
            | OrderError::AlreadyExists(_) => ErrorClass::BusinessRejection,
            OrderError::Database(_) => ErrorClass::TransientInfra,
            OrderError::NotFound(_)
            | OrderError::InvalidStateTransition { .. }
            | OrderError::CorruptState(_)
            | OrderError::Serialization(_) => ErrorClass::InvariantViolation,
        }
    }
}

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_rejections() {
        assert_eq!(OrderError::NoItems.class(), ErrorClass::BusinessRejection);
        assert_eq!(
            OrderError::NotFound(OrderId::new("o1")).class(),
            ErrorClass::InvariantViolation
        );
        assert_eq!(
            OrderError::InvalidStateTransition {
                from: OrderStatus::Created,
                to: OrderStatus::Created,
            }
            .class(),
            ErrorClass::InvariantViolation
        );
        assert_eq!(
            OrderError::Database(sqlx::Error::PoolTimedOut).class(),
            ErrorClass::TransientInfra
        );
    }

    #[test]
    fn messages_name_the_line() {
        let err = OrderError::InvalidQuantity {
            product_id: ProductId::new("product-1"),
            quantity: 0,
        };
        assert_eq!(
            err.to_string(),
            "Invalid quantity for product-1: 0 (must be greater than 0)"
        );
    }
}
