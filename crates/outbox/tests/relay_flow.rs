//! Relay behaviour against the in-process broker.

use std::time::Duration;

use bus::{Consumer, InMemoryBus, MessageBus, ORDER_QUEUE, Topology};
use common::{OrderId, PaymentId};
use contracts::{
    Decoded, EventEnvelope, PaymentFailed, SagaEvent, StockReservationFailed, StockReserved,
    decode,
};
use outbox::{InMemoryOutbox, OutboxMessage, OutboxRelay, OutboxStore, RelayConfig};

async fn saga_bus() -> InMemoryBus {
    let bus = InMemoryBus::new();
    Topology::saga().declare(&bus).await.unwrap();
    bus
}

fn reserved(order: &str) -> EventEnvelope {
    EventEnvelope::new(SagaEvent::StockReserved(StockReserved {
        order_id: OrderId::new(order),
        items: vec![contracts::StockItem {
            product_id: common::ProductId::new("product-1"),
            quantity: 2,
        }],
    }))
}

fn rejected(order: &str) -> EventEnvelope {
    EventEnvelope::new(SagaEvent::StockReservationFailed(StockReservationFailed {
        order_id: OrderId::new(order),
        reason: "insufficient stock".to_string(),
    }))
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(5),
        batch_size: 10,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_committed_rows_are_published_after_restart() {
    // Rows committed by a process that died before its relay ran.
    let outbox = InMemoryOutbox::standalone("stock");
    let envelope = reserved("o1");
    outbox
        .push(OutboxMessage::from_envelope("stock", &envelope).unwrap())
        .await;

    let bus = saga_bus().await;
    let relay = OutboxRelay::new(outbox.clone(), bus.clone()).with_config(fast_config());
    let report = relay.run_once().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(outbox.pending_count().await.unwrap(), 0);

    let mut consumer = bus.consume(ORDER_QUEUE).await.unwrap();
    let delivery = consumer.next().await.unwrap();
    match decode(delivery.body()).unwrap() {
        Decoded::Event(decoded) => assert_eq!(decoded, envelope),
        other => panic!("unexpected decode result: {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_failure_keeps_row_and_blocks_its_partition() {
    let outbox = InMemoryOutbox::standalone("stock");
    outbox
        .push(OutboxMessage::from_envelope("stock", &reserved("o1")).unwrap())
        .await;
    outbox
        .push(OutboxMessage::from_envelope("stock", &reserved("o2")).unwrap())
        .await;
    outbox
        .push(OutboxMessage::from_envelope("stock", &rejected("o1")).unwrap())
        .await;

    let bus = saga_bus().await;
    bus.fail_next_publishes(1);
    let relay = OutboxRelay::new(outbox.clone(), bus.clone()).with_config(fast_config());

    let first = relay.run_once().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.published, 1);
    assert_eq!(first.deferred, 1);

    let rows = outbox.rows().await;
    assert_eq!(rows[0].attempts, 1);
    assert!(rows[0].last_error.is_some());
    assert!(!rows[0].is_processed);
    assert!(rows[1].is_processed);
    assert!(!rows[2].is_processed);

    let second = relay.run_once().await.unwrap();
    assert_eq!(second.published, 2);

    // o1's events reach the bus in creation order.
    let o1_keys: Vec<String> = bus
        .published()
        .into_iter()
        .filter(|p| {
            matches!(
                decode(&p.message.body),
                Ok(Decoded::Event(e)) if e.event.order_id().as_str() == "o1"
            )
        })
        .map(|p| p.routing_key)
        .collect();
    assert_eq!(o1_keys, vec!["stock.reserved", "stock.reservation.failed"]);
}

#[tokio::test]
async fn test_relay_loop_backs_off_and_recovers() {
    let outbox = InMemoryOutbox::standalone("payment");
    outbox
        .push(
            OutboxMessage::for_event(
                "payment",
                SagaEvent::PaymentFailed(PaymentFailed {
                    order_id: OrderId::new("o1"),
                    payment_id: PaymentId::new(),
                    reason: "card declined".to_string(),
                }),
            )
            .unwrap(),
        )
        .await;

    let bus = saga_bus().await;
    bus.fail_next_publishes(3);
    let handle = OutboxRelay::new(outbox.clone(), bus.clone())
        .with_config(fast_config())
        .spawn();

    for _ in 0..200 {
        if outbox.pending_count().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.stop().await;

    assert_eq!(outbox.pending_count().await.unwrap(), 0);
    let rows = outbox.rows().await;
    assert_eq!(rows[0].attempts, 3);
    assert_eq!(bus.published_with_key("payment.failed").len(), 1);
}

#[tokio::test]
async fn test_relay_only_drains_its_own_source() {
    let outbox = InMemoryOutbox::standalone("stock");
    outbox
        .push(OutboxMessage::from_envelope("payment", &rejected("o1")).unwrap())
        .await;

    let bus = saga_bus().await;
    let relay = OutboxRelay::new(outbox.clone(), bus.clone());
    let report = relay.run_once().await.unwrap();

    assert_eq!(report.fetched, 0);
    assert!(bus.published().is_empty());
}
