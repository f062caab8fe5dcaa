//! Transactional outbox for saga events.
//!
//! A participant never publishes directly. It writes an [`OutboxMessage`] in the
//! same atomic unit as its state change, and an [`OutboxRelay`] later moves the
//! row to the bus, marking it processed only once the broker has confirmed it.
//! A crash between commit and publish therefore delays the event but never
//! loses it.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod relay;
pub mod store;

pub use error::{OutboxError, Result};
pub use memory::{InMemoryOutbox, OutboxTable};
pub use message::OutboxMessage;
pub use postgres::{PostgresOutboxStore, insert_outbox_message};
pub use relay::{OutboxRelay, RelayConfig, RelayHandle, RelayReport};
pub use store::OutboxStore;
