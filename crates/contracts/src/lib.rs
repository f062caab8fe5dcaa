//! Wire contracts of the order saga.
//!
//! Every message on the `saga.events` exchange is an [`EventEnvelope`]: an
//! `eventId` used as the idempotency key, a `timestamp`, and one variant of the
//! closed [`SagaEvent`] set. Incoming bytes go through [`decode`], which never
//! panics: schema violations surface as [`MalformedEvent`] and unknown event
//! types as [`Decoded::Unrecognized`].

pub mod envelope;
pub mod error;
pub mod events;
pub mod topics;

pub use envelope::{Decoded, EventEnvelope, decode};
pub use error::MalformedEvent;
pub use events::{
    OrderCancelled, OrderConfirmed, OrderCreated, OrderLine, PaymentFailed, PaymentProcessed,
    PaymentRefunded, PaymentRequested, SagaEvent, StockItem, StockReleased,
    StockReservationFailed, StockReserved,
};
pub use topics::SAGA_EXCHANGE;
