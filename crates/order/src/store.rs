use async_trait::async_trait;
use common::OrderId;
use outbox::OutboxMessage;

use crate::{Order, OrderError, OrderStatus, Result};

/// Persistence for orders.
///
/// Every write takes the outbox row announcing it and commits both or
/// neither.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order.
    ///
    /// Fails with `AlreadyExists`, writing nothing, if the id is taken.
    async fn create_with_outbox(&self, order: &Order, outbox: OutboxMessage) -> Result<()>;

    /// Moves an order out of `Created` into `to`, recording `reason` when
    /// cancelling.
    ///
    /// Returns false, writing nothing, when the order has already left
    /// `Created`. Fails with `InvalidStateTransition` when `Created` cannot
    /// move to `to`.
    async fn settle_with_outbox(
        &self,
        order_id: &OrderId,
        to: OrderStatus,
        reason: Option<&str>,
        outbox: OutboxMessage,
    ) -> Result<bool>;

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>>;

    /// All orders, oldest first.
    async fn list_orders(&self) -> Result<Vec<Order>>;
}

/// Refuses a settlement the order state machine does not allow.
pub(crate) fn check_settlement(to: OrderStatus) -> Result<()> {
    let from = OrderStatus::Created;
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrderError::InvalidStateTransition { from, to })
    }
}
