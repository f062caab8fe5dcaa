//! Stock participant of the order saga.
//!
//! Consumes `stock_events`. A `PaymentProcessed` reserves every line of the
//! order or none of them: sufficiency check and decrement are one conditional
//! update per product inside a single transaction, so `Product.quantity` can
//! never go negative and two orders racing for the last unit cannot both win.
//! A failed reservation is recorded and announced as `StockReservationFailed`,
//! which the payment service compensates. An `OrderCancelled` gives reserved
//! units back.

pub mod catalogue;
pub mod error;
pub mod handler;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use catalogue::demo_catalogue;
pub use error::{Result, StockError};
pub use handler::{StockConfig, StockHandler};
pub use memory::InMemoryStockStore;
pub use model::{Product, ReservationStatus, StockRejection, StockReservation};
pub use postgres::PostgresStockStore;
pub use store::{MAX_LINE_QUANTITY, ReserveOutcome, StockStore, merge_lines};

/// Outbox source name of this service.
pub const SOURCE: &str = "stock";
