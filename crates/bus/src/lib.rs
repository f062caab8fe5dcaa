//! Message bus for the choreographed saga.
//!
//! - [`MessageBus`] / [`Consumer`]: the broker seam (exchange, queue, binding,
//!   publish with confirmation, consume with explicit acknowledgement)
//! - [`InMemoryBus`]: an in-process topic broker with dead-letter queues
//! - [`Topology`]: the `saga.events` exchange and the per-participant queues
//! - [`QueueWorker`]: one supervised, one-message-at-a-time consumption loop
//!   per queue, with bounded retry and graceful drain

pub mod broker;
pub mod error;
pub mod matching;
pub mod memory;
pub mod message;
pub mod topology;
pub mod worker;

pub use broker::{Consumer, MessageBus};
pub use error::{BusError, Result};
pub use matching::topic_matches;
pub use memory::{DEFAULT_PUBLISH_LOG_CAPACITY, InMemoryBus, Published};
pub use message::{DEATH_REASON_HEADER, Delivery, ExchangeKind, Message, QueueSpec};
pub use topology::{ORDER_QUEUE, PAYMENT_QUEUE, QueueBinding, STOCK_QUEUE, Topology};
pub use worker::{
    Classify, ErrorClass, MessageHandler, QueueWorker, RetryPolicy, WorkerGroup, WorkerHandle,
    WorkerStats,
};
