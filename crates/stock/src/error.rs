use bus::{Classify, ErrorClass};
use common::{OrderId, ProductId};
use contracts::MalformedEvent;
use thiserror::Error;

/// Errors raised while handling stock events.
#[derive(Debug, Error)]
pub enum StockError {
    /// The incoming message does not fit the event schema.
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    /// The reservation was refused and the refusal recorded.
    #[error("Stock reservation for order {order_id} rejected: {reason}")]
    Rejected { order_id: OrderId, reason: String },

    /// A product was observed with negative stock.
    #[error("Product {product_id} has negative stock: {quantity}")]
    NegativeStock { product_id: ProductId, quantity: i64 },

    /// A quantity that does not fit a reservation row.
    #[error("Quantity {quantity} for product {product_id} is out of range")]
    QuantityOutOfRange { product_id: ProductId, quantity: u32 },

    /// Stored data that cannot be interpreted.
    #[error("Corrupt stock state: {0}")]
    CorruptState(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An outgoing event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for StockError {
    fn class(&self) -> ErrorClass {
        match self {
            StockError::Malformed(_) => ErrorClass::MalformedEvent,
            StockError::Rejected { .. } => ErrorClass::BusinessRejection,
            StockError::Database(_) => ErrorClass::TransientInfra,
            StockError::NegativeStock { .. }
            | StockError::QuantityOutOfRange { .. }
            | StockError::CorruptState(_)
            | StockError::Serialization(_) => ErrorClass::InvariantViolation,
        }
    }
}

/// Result type for stock operations.
pub type Result<T> = std::result::Result<T, StockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_row_is_an_invariant_violation() {
        let err = StockError::QuantityOutOfRange {
            product_id: ProductId::new("product-1"),
            quantity: u32::MAX,
        };
        assert_eq!(err.class(), ErrorClass::InvariantViolation);
        assert_eq!(
            err.to_string(),
            "Quantity 4294967295 for product product-1 is out of range"
        );
    }
}
