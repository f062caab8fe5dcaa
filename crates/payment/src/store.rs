use async_trait::async_trait;
use common::{OrderId, PaymentId};
use outbox::OutboxMessage;

use crate::{Payment, PaymentError, PaymentStatus, Result};

/// Persistence for payments.
///
/// Every write takes the outbox row announcing it and commits both or
/// neither.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts `payment` unless its order already has one.
    ///
    /// Returns false, writing nothing, when a payment for the order exists.
    async fn create_with_outbox(&self, payment: &Payment, outbox: OutboxMessage) -> Result<bool>;

    /// Moves a payment from `from` to `to`.
    ///
    /// Returns false, writing nothing, when the payment is not in `from`.
    /// Fails with `InvalidStateTransition` when `from` cannot move to `to`.
    async fn transition_with_outbox(
        &self,
        payment_id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        outbox: OutboxMessage,
    ) -> Result<bool>;

    async fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>>;

    async fn payment_for_order(&self, order_id: &OrderId) -> Result<Option<Payment>>;

    /// All payments, oldest first.
    async fn list_payments(&self) -> Result<Vec<Payment>>;
}

/// Refuses a `from` to `to` move the payment state machine does not allow.
pub(crate) fn check_transition(from: PaymentStatus, to: PaymentStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(PaymentError::InvalidStateTransition { from, to })
    }
}
