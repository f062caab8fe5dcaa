//! End-to-end saga runs over in-memory stores and the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use bus::{
    DEATH_REASON_HEADER, InMemoryBus, Message, MessageBus, ORDER_QUEUE, PAYMENT_QUEUE,
    RetryPolicy, STOCK_QUEUE,
};
use common::{CustomerId, Money, OrderId, ProductId};
use contracts::{OrderLine, SAGA_EXCHANGE};
use order::{InMemoryOrderStore, Order, OrderService, OrderStatus, OrderStore, PlaceOrder};
use outbox::{OutboxStore, RelayConfig};
use payment::{Payment, PaymentStatus, PaymentStore, SimulatedGateway};
use saga_node::{Config, InMemoryStores, Node};
use stock::StockStore;

fn fast_config() -> Config {
    Config {
        relay: RelayConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 100,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        },
        payment_latency: Duration::ZERO,
        ..Config::default()
    }
}

struct Harness {
    bus: InMemoryBus,
    stores: InMemoryStores,
    gateway: Arc<SimulatedGateway>,
    node: Node<InMemoryOrderStore>,
}

async fn start_with(stores: InMemoryStores) -> Harness {
    let bus = InMemoryBus::new();
    let gateway = Arc::new(SimulatedGateway::default());
    let node = saga_node::start_in_memory(fast_config(), bus.clone(), &stores, gateway.clone())
        .await
        .unwrap();
    Harness {
        bus,
        stores,
        gateway,
        node,
    }
}

async fn start() -> Harness {
    start_with(InMemoryStores::new()).await
}

fn place(order: &str, customer: &str, quantity: u32) -> PlaceOrder {
    PlaceOrder::new(
        OrderId::new(order),
        CustomerId::new(customer),
        vec![OrderLine {
            product_id: ProductId::new("product-1"),
            quantity,
            price: Money::from_units(50),
        }],
    )
}

async fn wait_for_order(h: &Harness, id: &str, status: OrderStatus) -> Order {
    let id = OrderId::new(id);
    for _ in 0..500 {
        if let Some(order) = h.node.orders().get_order(&id).await.unwrap() {
            if order.status == status {
                return order;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("order {id} never reached {status}");
}

async fn wait_for_payment(h: &Harness, id: &str, status: PaymentStatus) -> Payment {
    let id = OrderId::new(id);
    for _ in 0..500 {
        if let Some(payment) = h.stores.payments.payment_for_order(&id).await.unwrap() {
            if payment.status == status {
                return payment;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("payment for {id} never reached {status}");
}

/// Waits until every outbox is drained and every queue is empty and settled.
async fn wait_until_idle(h: &Harness) {
    let mut quiet_checks = 0;
    for _ in 0..500 {
        let pending = h.stores.orders.outbox().pending_count().await.unwrap()
            + h.stores.payments.outbox().pending_count().await.unwrap()
            + h.stores.stock.outbox().pending_count().await.unwrap();
        let in_flight: usize = [ORDER_QUEUE, PAYMENT_QUEUE, STOCK_QUEUE]
            .iter()
            .map(|q| h.bus.queue_depth(q) + h.bus.unacked_count(q))
            .sum();
        if pending == 0 && in_flight == 0 {
            quiet_checks += 1;
            if quiet_checks == 3 {
                return;
            }
        } else {
            quiet_checks = 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saga never went idle");
}

async fn stock_level(h: &Harness, product: &str) -> i64 {
    h.stores
        .stock
        .get_product(&ProductId::new(product))
        .await
        .unwrap()
        .unwrap()
        .quantity
}

fn routing_keys(h: &Harness) -> Vec<String> {
    h.bus
        .published()
        .into_iter()
        .filter(|p| p.exchange == SAGA_EXCHANGE)
        .map(|p| p.routing_key)
        .collect()
}

#[tokio::test]
async fn test_happy_path_confirms_order() {
    let h = start().await;

    let placed = h
        .node
        .orders()
        .place_order(place("o1", "c1", 2))
        .await
        .unwrap();
    assert_eq!(placed.total_amount, Money::from_units(100));

    wait_for_order(&h, "o1", OrderStatus::Confirmed).await;
    wait_until_idle(&h).await;

    let payment = wait_for_payment(&h, "o1", PaymentStatus::Completed).await;
    assert_eq!(payment.amount, Money::from_units(100));
    assert_eq!(stock_level(&h, "product-1").await, 8);

    let reservations = h
        .stores
        .stock
        .reservations_for_order(&OrderId::new("o1"))
        .await
        .unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].quantity, 2);

    assert_eq!(
        routing_keys(&h),
        vec![
            "order.created",
            "payment.requested",
            "payment.processed",
            "stock.reserved",
            "order.confirmed",
        ]
    );

    let stats = h.node.shutdown().await;
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|(_, s)| s.dead_lettered == 0));
}

#[tokio::test]
async fn test_insufficient_stock_refunds_and_cancels() {
    let h = start().await;
    h.stores
        .stock
        .force_quantity(&ProductId::new("product-1"), 1)
        .await;

    h.node
        .orders()
        .place_order(place("o1", "c1", 2))
        .await
        .unwrap();

    let order = wait_for_order(&h, "o1", OrderStatus::Cancelled).await;
    assert!(order
        .cancellation_reason
        .unwrap()
        .starts_with("Insufficient stock for product product-1"));
    let payment = wait_for_payment(&h, "o1", PaymentStatus::Refunded).await;
    wait_until_idle(&h).await;

    assert!(h.gateway.was_refunded(payment.id));
    assert_eq!(stock_level(&h, "product-1").await, 1);
    assert!(h
        .stores
        .stock
        .reservations_for_order(&OrderId::new("o1"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.bus.published_with_key("payment.refunded").len(), 1);
    assert!(h.bus.published_with_key("stock.released").is_empty());

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_declined_payment_cancels_without_touching_stock() {
    let h = start().await;
    h.gateway.decline_customer(CustomerId::new("c-blocked"));

    h.node
        .orders()
        .place_order(place("o1", "c-blocked", 2))
        .await
        .unwrap();

    let order = wait_for_order(&h, "o1", OrderStatus::Cancelled).await;
    assert_eq!(order.cancellation_reason.as_deref(), Some("card declined"));
    wait_for_payment(&h, "o1", PaymentStatus::Failed).await;
    wait_until_idle(&h).await;

    assert_eq!(stock_level(&h, "product-1").await, 10);
    assert!(h.bus.published_with_key("payment.processed").is_empty());
    assert!(h.bus.dead_letters(PAYMENT_QUEUE).is_empty());

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_order_created_is_ignored() {
    let h = start().await;
    h.node
        .orders()
        .place_order(place("o1", "c1", 2))
        .await
        .unwrap();
    wait_for_order(&h, "o1", OrderStatus::Confirmed).await;
    wait_until_idle(&h).await;

    let original = h.bus.published_with_key("order.created").remove(0);
    h.bus
        .publish(SAGA_EXCHANGE, "order.created", original.message)
        .await
        .unwrap();
    wait_until_idle(&h).await;

    assert_eq!(h.stores.payments.payment_count().await, 1);
    assert_eq!(h.gateway.charge_count(), 1);
    assert_eq!(stock_level(&h, "product-1").await, 8);

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let h = start().await;

    h.bus
        .publish(
            SAGA_EXCHANGE,
            "order.created",
            Message::json("garbage-1", b"{not json".to_vec()),
        )
        .await
        .unwrap();

    for _ in 0..500 {
        if !h.bus.dead_letters(PAYMENT_QUEUE).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let dead = h.bus.dead_letters(PAYMENT_QUEUE);
    assert_eq!(dead.len(), 1);
    assert!(dead[0].headers.contains_key(DEATH_REASON_HEADER));

    // The worker keeps going.
    h.node
        .orders()
        .place_order(place("o1", "c1", 1))
        .await
        .unwrap();
    wait_for_order(&h, "o1", OrderStatus::Confirmed).await;

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let h = start().await;
    let body = serde_json::json!({
        "eventId": "5f0c4a56-2d1e-4e55-9a55-8f9f3c1c0b11",
        "timestamp": "2024-01-01T00:00:00Z",
        "eventType": "OrderShipped",
        "orderId": "o1",
    });

    h.bus
        .publish(
            SAGA_EXCHANGE,
            "order.created",
            Message::json("shipped-1", serde_json::to_vec(&body).unwrap()),
        )
        .await
        .unwrap();
    wait_until_idle(&h).await;

    assert!(h.bus.dead_letters(PAYMENT_QUEUE).is_empty());
    assert_eq!(h.stores.payments.payment_count().await, 0);

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_events_committed_before_a_crash_are_published_on_restart() {
    let stores = InMemoryStores::new();

    // Committed while no relay was running.
    let orders = OrderService::new(stores.orders.clone());
    orders.place_order(place("o1", "c1", 2)).await.unwrap();
    let committed = stores.orders.outbox().rows().await.remove(0);
    assert!(!committed.is_processed);

    let h = start_with(stores).await;
    wait_for_order(&h, "o1", OrderStatus::Confirmed).await;

    let published = h.bus.published_with_key("order.created").remove(0);
    let body: serde_json::Value = serde_json::from_slice(&published.message.body).unwrap();
    assert_eq!(body, committed.payload);
    assert_eq!(published.message.message_id, committed.event_id.to_string());

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_broker_outage_delays_but_does_not_lose_events() {
    let h = start().await;
    h.bus.fail_next_publishes(3);

    h.node
        .orders()
        .place_order(place("o1", "c1", 1))
        .await
        .unwrap();

    wait_for_order(&h, "o1", OrderStatus::Confirmed).await;
    let row = h.stores.orders.outbox().rows().await.remove(0);
    assert!(row.is_processed);
    assert!(row.attempts >= 1);
    assert!(row.last_error.is_some());

    h.node.shutdown().await;
}

#[tokio::test]
async fn test_orders_are_listed_oldest_first() {
    let h = start().await;
    for id in ["o1", "o2", "o3"] {
        h.node
            .orders()
            .place_order(place(id, "c1", 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for id in ["o1", "o2", "o3"] {
        wait_for_order(&h, id, OrderStatus::Confirmed).await;
    }

    let ids: Vec<String> = h
        .node
        .orders()
        .list_orders()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.id.to_string())
        .collect();
    assert_eq!(ids, vec!["o1", "o2", "o3"]);
    assert_eq!(stock_level(&h, "product-1").await, 7);
    assert_eq!(h.stores.orders.list_orders().await.unwrap().len(), 3);

    h.node.shutdown().await;
}
