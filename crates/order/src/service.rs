//! Order placement and settlement.

use std::sync::Arc;

use async_trait::async_trait;
use bus::{Delivery, MessageHandler};
use common::OrderId;
use contracts::{
    Decoded, EventEnvelope, OrderCancelled, OrderConfirmed, OrderCreated, SagaEvent, decode,
};
use outbox::OutboxMessage;

use crate::{Order, OrderError, OrderStatus, OrderStore, PlaceOrder, Result, SOURCE};

/// Places orders and handles `order_events`.
pub struct OrderService<S> {
    store: Arc<S>,
}

impl<S: OrderStore + 'static> OrderService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validates and stores a new order, starting the saga.
    #[tracing::instrument(skip(self, command), fields(order_id = %command.order_id, customer_id = %command.customer_id))]
    pub async fn place_order(&self, command: PlaceOrder) -> Result<Order> {
        let order = Order::place(command)?;
        let created = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::OrderCreated(OrderCreated {
                order_id: order.id.clone(),
                customer_id: order.customer_id.clone(),
                total_amount: order.total_amount,
                items: order.items.clone(),
            }),
        )?;

        self.store.create_with_outbox(&order, created).await?;
        metrics::counter!("saga_orders_placed_total").increment(1);
        tracing::info!(total = %order.total_amount, lines = order.items.len(), "order placed");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        self.store.get_order(order_id).await
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        self.store.list_orders().await
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
            SagaEvent::StockReserved(event) => self.confirm(&event.order_id).await,
            SagaEvent::StockReservationFailed(event) => {
                self.cancel(&event.order_id, &event.reason).await
            }
            SagaEvent::PaymentFailed(event) => self.cancel(&event.order_id, &event.reason).await,
            _ => {
                tracing::debug!("event not handled by order service");
                Ok(())
            }
        }
    }

    async fn confirm(&self, order_id: &OrderId) -> Result<()> {
        let confirmed = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::OrderConfirmed(OrderConfirmed {
                order_id: order_id.clone(),
            }),
        )?;
        if self
            .store
            .settle_with_outbox(order_id, OrderStatus::Confirmed, None, confirmed)
            .await?
        {
            metrics::counter!("saga_orders_confirmed_total").increment(1);
            tracing::info!("order confirmed");
        } else {
            tracing::debug!("order already settled, skipping");
        }
        Ok(())
    }

    async fn cancel(&self, order_id: &OrderId, reason: &str) -> Result<()> {
        let cancelled = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::OrderCancelled(OrderCancelled {
                order_id: order_id.clone(),
                reason: reason.to_string(),
            }),
        )?;
        if self
            .store
            .settle_with_outbox(order_id, OrderStatus::Cancelled, Some(reason), cancelled)
            .await?
        {
            metrics::counter!("saga_orders_cancelled_total").increment(1);
            tracing::info!(%reason, "order cancelled");
        } else {
            tracing::debug!("order already settled, skipping");
        }
        Ok(())
    }
}

#[async_trait]
impl<S: OrderStore + 'static> MessageHandler for OrderService<S> {
    type Error = OrderError;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryOrderStore;
    use bus::{Classify, ErrorClass};
    use common::{CustomerId, Money, PaymentId, ProductId};
    use contracts::{OrderLine, PaymentFailed, StockItem, StockReservationFailed, StockReserved};
    use outbox::OutboxStore;

    fn service() -> (Arc<InMemoryOrderStore>, OrderService<InMemoryOrderStore>) {
        let store = Arc::new(InMemoryOrderStore::new());
        (store.clone(), OrderService::new(store))
    }

    fn place(order: &str) -> PlaceOrder {
        PlaceOrder::new(
            OrderId::new(order),
            CustomerId::new("c1"),
            vec![OrderLine {
                product_id: ProductId::new("product-1"),
                quantity: 2,
                price: Money::from_units(50),
            }],
        )
    }

    fn stock_reserved(order: &str) -> EventEnvelope {
        EventEnvelope::new(SagaEvent::StockReserved(StockReserved {
            order_id: OrderId::new(order),
            items: vec![StockItem {
                product_id: ProductId::new("product-1"),
                quantity: 2,
            }],
        }))
    }

    fn stock_failed(order: &str) -> EventEnvelope {
        EventEnvelope::new(SagaEvent::StockReservationFailed(StockReservationFailed {
            order_id: OrderId::new(order),
            reason: "Insufficient stock for product product-1: requested 2, available 1"
                .to_string(),
        }))
    }

    async fn last_event(store: &InMemoryOrderStore) -> SagaEvent {
        let rows = store.outbox().rows().await;
        let row = rows.last().unwrap();
        match decode(&serde_json::to_vec(&row.payload).unwrap()).unwrap() {
            Decoded::Event(envelope) => envelope.event,
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_place_order_enqueues_order_created() {
        let (store, service) = service();

        let order = service.place_order(place("o1")).await.unwrap();

        assert_eq!(order.total_amount, Money::from_units(100));
        match last_event(&store).await {
            SagaEvent::OrderCreated(e) => {
                assert_eq!(e.order_id, OrderId::new("o1"));
                assert_eq!(e.total_amount, Money::from_units(100));
                assert_eq!(e.items.len(), 1);
            }
            other => panic!("expected OrderCreated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_order_writes_nothing() {
        let (store, service) = service();
        let mut command = place("o1");
        command.items[0].quantity = 0;

        let err = service.place_order(command).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity { .. }));
        assert!(service.list_orders().await.unwrap().is_empty());
        assert_eq!(store.outbox().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stock_reserved_confirms_once() {
        let (store, service) = service();
        service.place_order(place("o1")).await.unwrap();

        service.handle_event(&stock_reserved("o1")).await.unwrap();
        service.handle_event(&stock_reserved("o1")).await.unwrap();

        let order = service.get_order(&OrderId::new("o1")).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert!(matches!(
            last_event(&store).await,
            SagaEvent::OrderConfirmed(_)
        ));
        assert_eq!(store.outbox().pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stock_failure_cancels_with_reason() {
        let (store, service) = service();
        service.place_order(place("o1")).await.unwrap();

        service.handle_event(&stock_failed("o1")).await.unwrap();

        let order = service.get_order(&OrderId::new("o1")).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order
            .cancellation_reason
            .unwrap()
            .starts_with("Insufficient stock"));
        match last_event(&store).await {
            SagaEvent::OrderCancelled(e) => assert!(e.reason.starts_with("Insufficient stock")),
            other => panic!("expected OrderCancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payment_failure_cancels() {
        let (_, service) = service();
        service.place_order(place("o1")).await.unwrap();

        let failed = EventEnvelope::new(SagaEvent::PaymentFailed(PaymentFailed {
            order_id: OrderId::new("o1"),
            payment_id: PaymentId::new(),
            reason: "card declined".to_string(),
        }));
        service.handle_event(&failed).await.unwrap();

        let order = service.get_order(&OrderId::new("o1")).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some("card declined"));
    }

    #[tokio::test]
    async fn test_late_outcome_does_not_flip_a_settled_order() {
        let (_, service) = service();
        service.place_order(place("o1")).await.unwrap();
        service.handle_event(&stock_reserved("o1")).await.unwrap();

        service.handle_event(&stock_failed("o1")).await.unwrap();

        let order = service.get_order(&OrderId::new("o1")).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert!(order.cancellation_reason.is_none());
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_order_is_invariant_violation() {
        let (_, service) = service();
        let err = service
            .handle_event(&stock_reserved("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation);
    }

    #[tokio::test]
    async fn test_database_outage_is_transient() {
        let (store, service) = service();
        service.place_order(place("o1")).await.unwrap();
        store.fail_next_writes(1).await;

        let err = service
            .handle_event(&stock_reserved("o1"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientInfra);

        service.handle_event(&stock_reserved("o1")).await.unwrap();
        let order = service.get_order(&OrderId::new("o1")).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
    }
}
