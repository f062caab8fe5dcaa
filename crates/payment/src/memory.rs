use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, PaymentId};
use outbox::{InMemoryOutbox, OutboxMessage, OutboxTable};
use tokio::sync::Mutex;

use crate::store::check_transition;
use crate::{Payment, PaymentError, PaymentStatus, PaymentStore, Result, SOURCE};

/// Payments and the payment outbox, guarded by one lock.
#[derive(Debug, Default)]
pub struct PaymentState {
    payments: HashMap<PaymentId, Payment>,
    by_order: HashMap<OrderId, PaymentId>,
    outbox: OutboxTable,
    failing_writes: u32,
}

impl PaymentState {
    fn check_available(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PaymentError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl AsMut<OutboxTable> for PaymentState {
    fn as_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

/// In-memory payment store for tests and database-less runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentStore {
    state: Arc<Mutex<PaymentState>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox written by this store, for the relay.
    pub fn outbox(&self) -> InMemoryOutbox<PaymentState> {
        InMemoryOutbox::new(self.state.clone(), SOURCE)
    }

    /// Makes the next `count` writes fail as if the database were down.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create_with_outbox(&self, payment: &Payment, outbox: OutboxMessage) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.by_order.contains_key(&payment.order_id) {
            return Ok(false);
        }
        state
            .by_order
            .insert(payment.order_id.clone(), payment.id);
        state.payments.insert(payment.id, payment.clone());
        state.outbox.push(outbox);
        Ok(true)
    }

    async fn transition_with_outbox(
        &self,
        payment_id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        check_transition(from, to)?;
        let mut state = self.state.lock().await;
        state.check_available()?;

        let Some(payment) = state.payments.get_mut(&payment_id) else {
            return Err(PaymentError::NotFound(payment_id));
        };
        if payment.status != from {
            return Ok(false);
        }
        payment.status = to;
        payment.updated_at = Utc::now();
        state.outbox.push(outbox);
        Ok(true)
    }

    async fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn payment_for_order(&self, order_id: &OrderId) -> Result<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .by_order
            .get(order_id)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn list_payments(&self) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> =
            self.state.lock().await.payments.values().cloned().collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }
}
