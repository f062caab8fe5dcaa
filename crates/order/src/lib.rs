//! Order participant of the order saga.
//!
//! Starts the saga: [`OrderService::place_order`] validates the lines,
//! prices the order and stores it as `Created` together with its
//! `OrderCreated` outbox row. Consumes `order_events` to settle the order:
//! `StockReserved` confirms it, `StockReservationFailed` or `PaymentFailed`
//! cancels it. Each settlement is announced as `OrderConfirmed` or
//! `OrderCancelled`.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod store;

pub use error::{OrderError, Result};
pub use memory::InMemoryOrderStore;
pub use model::{Order, OrderStatus, PlaceOrder};
pub use postgres::PostgresOrderStore;
pub use service::OrderService;
pub use store::OrderStore;

/// Outbox source name of this service.
pub const SOURCE: &str = "order";
