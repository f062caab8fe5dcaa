//! Payment participant of the order saga.
//!
//! Consumes `payment_events`:
//!
//! - `OrderCreated` opens a payment in `Processing` and schedules the charge
//!   by enqueueing `PaymentRequested`
//! - `PaymentRequested` runs the charge under a timeout and records the
//!   outcome as `PaymentProcessed` or `PaymentFailed`
//! - `StockReservationFailed` is the compensator: a completed payment is
//!   refunded and `PaymentRefunded` announced
//!
//! Every state change and the event announcing it are committed together
//! through the outbox.

pub mod error;
pub mod gateway;
pub mod handler;
pub mod memory;
pub mod payment;
pub mod postgres;
pub mod store;

pub use error::{PaymentError, Result};
pub use gateway::{ChargeError, ChargeReceipt, ChargeRequest, PaymentGateway, SimulatedGateway};
pub use handler::{PaymentConfig, PaymentHandler};
pub use memory::InMemoryPaymentStore;
pub use payment::{Payment, PaymentStatus};
pub use postgres::PostgresPaymentStore;
pub use store::PaymentStore;

/// Outbox source name of this service.
pub const SOURCE: &str = "payment";
