//! Exchange name, event type names and routing keys.
//!
//! Routing keys are the dot-notation of the event type, which lets queues bind
//! with topic wildcards such as `stock.#`.

/// The single durable topic exchange carrying every saga event.
pub const SAGA_EXCHANGE: &str = "saga.events";

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_CONFIRMED: &str = "order.confirmed";
pub const ORDER_CANCELLED: &str = "order.cancelled";
pub const PAYMENT_REQUESTED: &str = "payment.requested";
pub const PAYMENT_PROCESSED: &str = "payment.processed";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_REFUNDED: &str = "payment.refunded";
pub const STOCK_RESERVED: &str = "stock.reserved";
pub const STOCK_RESERVATION_FAILED: &str = "stock.reservation.failed";
pub const STOCK_RELEASED: &str = "stock.released";
