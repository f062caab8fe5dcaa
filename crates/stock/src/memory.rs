use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, ProductId};
use contracts::StockItem;
use outbox::{InMemoryOutbox, OutboxMessage, OutboxTable};
use tokio::sync::Mutex;

use crate::{
    Product, ReservationStatus, ReserveOutcome, Result, SOURCE, StockError, StockRejection,
    StockReservation, StockStore, store::merge_lines,
};

/// Products, reservations, rejections and the stock outbox, under one lock.
#[derive(Debug, Default)]
pub struct StockState {
    products: BTreeMap<ProductId, Product>,
    reservations: Vec<StockReservation>,
    rejections: HashMap<OrderId, StockRejection>,
    outbox: OutboxTable,
    failing_writes: u32,
    check_latency: Duration,
}

impl StockState {
    fn check_available(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StockError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn is_processed(&self, order_id: &OrderId) -> bool {
        self.rejections.contains_key(order_id)
            || self.reservations.iter().any(|r| &r.order_id == order_id)
    }
}

impl AsMut<OutboxTable> for StockState {
    fn as_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

/// In-memory stock store for tests and database-less runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<StockState>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox written by this store, for the relay.
    pub fn outbox(&self) -> InMemoryOutbox<StockState> {
        InMemoryOutbox::new(self.state.clone(), SOURCE)
    }

    /// Makes the next `count` writes fail as if the database were down.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    /// Delays every reservation attempt, as a slow database would.
    pub async fn set_check_latency(&self, latency: Duration) {
        self.state.lock().await.check_latency = latency;
    }

    /// Overwrites a product's stock level, bypassing every check.
    pub async fn force_quantity(&self, product_id: &ProductId, quantity: i64) {
        if let Some(product) = self.state.lock().await.products.get_mut(product_id) {
            product.quantity = quantity;
        }
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn reserve_with_outbox(
        &self,
        order_id: &OrderId,
        items: &[StockItem],
        outbox: OutboxMessage,
    ) -> Result<ReserveOutcome> {
        let latency = self.state.lock().await.check_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let items = match merge_lines(items) {
            Ok(items) => items,
            Err(product_id) => return Ok(ReserveOutcome::QuantityOutOfRange(product_id)),
        };
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.is_processed(order_id) {
            return Ok(ReserveOutcome::AlreadyProcessed);
        }

        // Check every line before touching anything: all or nothing.
        for item in &items {
            let Some(product) = state.products.get(&item.product_id) else {
                return Ok(ReserveOutcome::UnknownProduct(item.product_id.clone()));
            };
            if product.quantity < 0 {
                return Err(StockError::NegativeStock {
                    product_id: product.id.clone(),
                    quantity: product.quantity,
                });
            }
            if product.quantity < i64::from(item.quantity) {
                return Ok(ReserveOutcome::Insufficient {
                    product_id: product.id.clone(),
                    requested: item.quantity,
                    available: product.quantity,
                });
            }
        }

        let mut reserved = Vec::with_capacity(items.len());
        for item in &items {
            if let Some(product) = state.products.get_mut(&item.product_id) {
                product.quantity -= i64::from(item.quantity);
            }
            reserved.push(StockReservation::new(
                order_id.clone(),
                item.product_id.clone(),
                item.quantity,
            ));
        }
        state.reservations.extend(reserved.iter().cloned());
        state.outbox.push(outbox);
        Ok(ReserveOutcome::Reserved(reserved))
    }

    async fn record_rejection_with_outbox(
        &self,
        order_id: &OrderId,
        reason: &str,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.is_processed(order_id) {
            return Ok(false);
        }

        state.rejections.insert(
            order_id.clone(),
            StockRejection {
                order_id: order_id.clone(),
                reason: reason.to_string(),
                created_at: Utc::now(),
            },
        );
        state.outbox.push(outbox);
        Ok(true)
    }

    async fn release_with_outbox(
        &self,
        reservations: &[StockReservation],
        outbox: OutboxMessage,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let all_reserved = reservations.iter().all(|wanted| {
            state
                .reservations
                .iter()
                .any(|r| r.id == wanted.id && r.status == ReservationStatus::Reserved)
        });
        if !all_reserved {
            return Ok(false);
        }
        if let Some(orphan) = reservations
            .iter()
            .find(|r| !state.products.contains_key(&r.product_id))
        {
            return Err(StockError::CorruptState(format!(
                "reservation {} references missing product {}",
                orphan.id, orphan.product_id
            )));
        }

        let now = Utc::now();
        for wanted in reservations {
            if let Some(r) = state.reservations.iter_mut().find(|r| r.id == wanted.id) {
                r.status = ReservationStatus::Released;
                r.updated_at = now;
            }
            if let Some(product) = state.products.get_mut(&wanted.product_id) {
                product.quantity += i64::from(wanted.quantity);
            }
        }
        state.outbox.push(outbox);
        Ok(true)
    }

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        Ok(self.state.lock().await.products.get(product_id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        Ok(self.state.lock().await.products.values().cloned().collect())
    }

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<StockReservation>> {
        Ok(self
            .state
            .lock()
            .await
            .reservations
            .iter()
            .filter(|r| &r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn rejection_for_order(&self, order_id: &OrderId) -> Result<Option<StockRejection>> {
        Ok(self.state.lock().await.rejections.get(order_id).cloned())
    }

    async fn seed_products(&self, products: &[Product]) -> Result<usize> {
        let mut state = self.state.lock().await;
        if !state.products.is_empty() {
            return Ok(0);
        }
        for product in products {
            state.products.insert(product.id.clone(), product.clone());
        }
        Ok(products.len())
    }
}
