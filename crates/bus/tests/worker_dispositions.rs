//! Worker behaviour against the in-process broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{
    Classify, DEATH_REASON_HEADER, Delivery, ErrorClass, InMemoryBus, Message, MessageBus,
    MessageHandler, QueueSpec, QueueWorker, RetryPolicy, WorkerGroup,
};
use tokio::sync::Mutex;

const EXCHANGE: &str = "saga.events";
const QUEUE: &str = "test_events";

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct TestError {
    class: ErrorClass,
    message: String,
}

impl Classify for TestError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Decides the outcome from the message body.
#[derive(Default)]
struct ScriptedHandler {
    seen: Mutex<HashMap<String, u32>>,
}

impl ScriptedHandler {
    async fn attempts(&self, id: &str) -> u32 {
        self.seen.lock().await.get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    type Error = TestError;

    async fn handle(&self, delivery: &Delivery) -> Result<(), TestError> {
        let attempt = {
            let mut seen = self.seen.lock().await;
            let count = seen.entry(delivery.message.message_id.clone()).or_default();
            *count += 1;
            *count
        };

        let fail = |class, message: &str| {
            Err(TestError {
                class,
                message: message.to_string(),
            })
        };
        match delivery.body() {
            b"ok" => Ok(()),
            b"garbage" => fail(ErrorClass::MalformedEvent, "not valid JSON"),
            b"reject" => fail(ErrorClass::BusinessRejection, "insufficient stock"),
            b"corrupt" => fail(ErrorClass::InvariantViolation, "negative stock"),
            b"down" => fail(ErrorClass::TransientInfra, "database unavailable"),
            b"flaky" if attempt < 3 => fail(ErrorClass::TransientInfra, "connection reset"),
            b"flaky" => Ok(()),
            _ => fail(ErrorClass::MalformedEvent, "unexpected body"),
        }
    }
}

async fn setup() -> InMemoryBus {
    let bus = InMemoryBus::new();
    bus.declare_exchange(EXCHANGE, bus::ExchangeKind::Topic)
        .await
        .unwrap();
    bus.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    bus.bind_queue(QUEUE, EXCHANGE, "#").await.unwrap();
    bus
}

async fn publish(bus: &InMemoryBus, id: &str, body: &[u8]) {
    bus.publish(EXCHANGE, "test.event", Message::json(id, body.to_vec()))
        .await
        .unwrap();
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

async fn wait_until_drained(bus: &InMemoryBus) {
    for _ in 0..500 {
        if bus.queue_depth(QUEUE) == 0 && bus.unacked_count(QUEUE) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("queue did not drain");
}

#[tokio::test]
async fn test_each_error_class_gets_its_disposition() {
    let bus = setup().await;
    let handler = Arc::new(ScriptedHandler::default());

    publish(&bus, "m-ok", b"ok").await;
    publish(&bus, "m-garbage", b"garbage").await;
    publish(&bus, "m-reject", b"reject").await;
    publish(&bus, "m-corrupt", b"corrupt").await;

    let worker = QueueWorker::new(bus.clone(), QUEUE, handler.clone())
        .with_policy(fast_policy())
        .spawn();
    wait_until_drained(&bus).await;
    let stats = worker.stop().await;

    assert_eq!(stats.handled, 4);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.dead_lettered, 2);

    let dead = bus.dead_letters(QUEUE);
    let ids: Vec<&str> = dead.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m-garbage", "m-corrupt"]);
    assert_eq!(
        dead[0].headers.get(DEATH_REASON_HEADER).map(String::as_str),
        Some("not valid JSON")
    );
    // Malformed messages are never retried.
    assert_eq!(handler.attempts("m-garbage").await, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_until_success() {
    let bus = setup().await;
    let handler = Arc::new(ScriptedHandler::default());
    publish(&bus, "m-flaky", b"flaky").await;

    let worker = QueueWorker::new(bus.clone(), QUEUE, handler.clone())
        .with_policy(fast_policy())
        .spawn();
    wait_until_drained(&bus).await;
    let stats = worker.stop().await;

    assert_eq!(handler.attempts("m-flaky").await, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acked, 1);
    assert!(bus.dead_letters(QUEUE).is_empty());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let bus = setup().await;
    let handler = Arc::new(ScriptedHandler::default());
    publish(&bus, "m-down", b"down").await;

    let worker = QueueWorker::new(bus.clone(), QUEUE, handler.clone())
        .with_policy(fast_policy())
        .spawn();
    wait_until_drained(&bus).await;
    worker.stop().await;

    assert_eq!(handler.attempts("m-down").await, 3);
    let dead = bus.dead_letters(QUEUE);
    assert_eq!(dead.len(), 1);
    assert!(
        dead[0]
            .headers
            .get(DEATH_REASON_HEADER)
            .is_some_and(|r| r.starts_with("retries exhausted"))
    );
}

#[tokio::test]
async fn test_worker_stops_when_idle_and_leaves_later_messages() {
    let bus = setup().await;
    let handler = Arc::new(ScriptedHandler::default());

    let mut group = WorkerGroup::new();
    group.push(QueueWorker::new(bus.clone(), QUEUE, handler.clone()).spawn());
    assert_eq!(group.len(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stopped = group.stop_all().await;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].0, QUEUE);

    publish(&bus, "m-late", b"ok").await;
    assert_eq!(bus.queue_depth(QUEUE), 1);
    assert_eq!(handler.attempts("m-late").await, 0);
}

#[tokio::test]
async fn test_consuming_unknown_queue_gives_up_on_shutdown() {
    let bus = InMemoryBus::new();
    let handler = Arc::new(ScriptedHandler::default());
    let worker = QueueWorker::new(bus, "missing", handler)
        .with_policy(fast_policy())
        .spawn();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = worker.stop().await;
    assert_eq!(stats.handled, 0);
}
