//! Shared value types for the choreographed order saga.
//!
//! Every participant speaks in these identifiers on the wire, but each one
//! persists and mutates only its own entities.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{CustomerId, EventId, OrderId, PaymentId, ProductId, ReservationId};
