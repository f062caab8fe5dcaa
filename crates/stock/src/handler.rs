//! Event handling for the stock participant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{Delivery, MessageHandler};
use common::{OrderId, ProductId};
use contracts::{
    Decoded, EventEnvelope, OrderCancelled, PaymentProcessed, SagaEvent, StockItem,
    StockReleased, StockReservationFailed, StockReserved, decode,
};
use outbox::OutboxMessage;

use crate::{
    ReservationStatus, ReserveOutcome, Result, SOURCE, StockError, StockStore, merge_lines,
};

/// Settings of the stock participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockConfig {
    /// Longest a reservation attempt may take before the order is rejected.
    pub check_timeout: Duration,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles `stock_events`.
pub struct StockHandler<S> {
    store: Arc<S>,
    config: StockConfig,
}

impl<S: StockStore + 'static> StockHandler<S> {
    pub fn new(store: Arc<S>, config: StockConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies one decoded event.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            event_id = %envelope.event_id,
            event_type = envelope.event_type(),
            order_id = %envelope.event.order_id()
        )
    )]
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<()> {
        match &envelope.event {
            SagaEvent::PaymentProcessed(event) => self.reserve(event).await,
            SagaEvent::OrderCancelled(event) => self.release(event).await,
            _ => {
                tracing::debug!("event not handled by stock service");
                Ok(())
            }
        }
    }

    async fn reserve(&self, event: &PaymentProcessed) -> Result<()> {
        let items = match merge_lines(&event.items) {
            Ok(items) => items,
            Err(product_id) => {
                return self
                    .reject(&event.order_id, quantity_out_of_range(&product_id))
                    .await;
            }
        };
        let reserved = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::StockReserved(StockReserved {
                order_id: event.order_id.clone(),
                items: items.clone(),
            }),
        )?;

        let attempt = tokio::time::timeout(
            self.config.check_timeout,
            self.store
                .reserve_with_outbox(&event.order_id, &items, reserved),
        )
        .await;

        let reason = match attempt {
            Ok(Ok(ReserveOutcome::Reserved(reservations))) => {
                metrics::counter!("saga_stock_reserved_total").increment(1);
                tracing::info!(lines = reservations.len(), "stock reserved");
                return Ok(());
            }
            Ok(Ok(ReserveOutcome::AlreadyProcessed)) => {
                tracing::debug!("order already handled, skipping");
                return Ok(());
            }
            Ok(Ok(ReserveOutcome::Insufficient {
                product_id,
                requested,
                available,
            })) => format!(
                "Insufficient stock for product {product_id}: requested {requested}, available {available}"
            ),
            Ok(Ok(ReserveOutcome::UnknownProduct(product_id))) => {
                format!("Product not found: {product_id}")
            }
            Ok(Ok(ReserveOutcome::QuantityOutOfRange(product_id))) => {
                quantity_out_of_range(&product_id)
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => "Stock check timed out".to_string(),
        };

        self.reject(&event.order_id, reason).await
    }

    async fn reject(&self, order_id: &OrderId, reason: String) -> Result<()> {
        let failed = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::StockReservationFailed(StockReservationFailed {
                order_id: order_id.clone(),
                reason: reason.clone(),
            }),
        )?;

        if !self
            .store
            .record_rejection_with_outbox(order_id, &reason, failed)
            .await?
        {
            tracing::debug!("order handled concurrently, rejection not recorded");
            return Ok(());
        }

        metrics::counter!("saga_stock_rejected_total").increment(1);
        Err(StockError::Rejected {
            order_id: order_id.clone(),
            reason,
        })
    }

    async fn release(&self, event: &OrderCancelled) -> Result<()> {
        let reserved: Vec<_> = self
            .store
            .reservations_for_order(&event.order_id)
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Reserved)
            .collect();
        if reserved.is_empty() {
            tracing::debug!("nothing reserved for order, skipping");
            return Ok(());
        }

        let released = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::StockReleased(StockReleased {
                order_id: event.order_id.clone(),
                items: reserved
                    .iter()
                    .map(|r| StockItem {
                        product_id: r.product_id.clone(),
                        quantity: r.quantity,
                    })
                    .collect(),
            }),
        )?;

        if self.store.release_with_outbox(&reserved, released).await? {
            tracing::info!(lines = reserved.len(), reason = %event.reason, "stock released");
        } else {
            tracing::debug!("reservations released concurrently, skipping");
        }
        Ok(())
    }
}

fn quantity_out_of_range(product_id: &ProductId) -> String {
    format!("Requested quantity out of range for product {product_id}")
}

#[async_trait]
impl<S: StockStore + 'static> MessageHandler for StockHandler<S> {
    type Error = StockError;

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        match decode(delivery.body())? {
            Decoded::Event(envelope) => self.handle_event(&envelope).await,
            Decoded::Unrecognized { event_type } => {
                tracing::debug!(%event_type, "ignoring unknown event type");
                Ok(())
            }
        }
    }
}
