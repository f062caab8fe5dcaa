use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use outbox::{InMemoryOutbox, OutboxMessage, OutboxTable};
use tokio::sync::Mutex;

use crate::store::check_settlement;
use crate::{Order, OrderError, OrderStatus, OrderStore, Result, SOURCE};

/// Orders and the order outbox, guarded by one lock.
#[derive(Debug, Default)]
pub struct OrderState {
    orders: HashMap<OrderId, Order>,
    outbox: OutboxTable,
    failing_writes: u32,
}

impl OrderState {
    fn check_available(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(OrderError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl AsMut<OutboxTable> for OrderState {
    fn as_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

/// In-memory order store for tests and database-less runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<OrderState>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox written by this store, for the relay.
    pub fn outbox(&self) -> InMemoryOutbox<OrderState> {
        InMemoryOutbox::new(self.state.clone(), SOURCE)
    }

    /// Makes the next `count` writes fail as if the database were down.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_with_outbox(&self, order: &Order, outbox: OutboxMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.orders.contains_key(&order.id) {
            return Err(OrderError::AlreadyExists(order.id.clone()));
        }
        state.orders.insert(order.id.clone(), order.clone());
        state.outbox.push(outbox);
        Ok(())
    }

    async fn settle_with_outbox(
        &self,
        order_id: &OrderId,
        to: OrderStatus,
        reason: Option<&str>,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        check_settlement(to)?;
        let mut state = self.state.lock().await;
        state.check_available()?;

        let Some(order) = state.orders.get_mut(order_id) else {
            return Err(OrderError::NotFound(order_id.clone()));
        };
        if order.status != OrderStatus::Created {
            return Ok(false);
        }
        order.status = to;
        order.cancellation_reason = reason.map(str::to_string);
        order.updated_at = Utc::now();
        state.outbox.push(outbox);
        Ok(true)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(order_id).cloned())
    }

    async fn list_orders(&self) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self.state.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }
}
