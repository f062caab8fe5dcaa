//! In-process broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{Consumer, MessageBus};
use crate::matching::topic_matches;
use crate::message::DEATH_QUEUE_HEADER;
use crate::{BusError, DEATH_REASON_HEADER, Delivery, ExchangeKind, Message, QueueSpec, Result};

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Debug, Clone)]
struct Queued {
    exchange: String,
    routing_key: String,
    message: Message,
    delivery_count: u32,
}

#[derive(Debug)]
struct Unacked {
    consumer_id: u64,
    queued: Queued,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Queued>,
    unacked: BTreeMap<u64, Unacked>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push_back(&mut self, queued: Queued) {
        self.ready.push_back(queued);
        self.notify.notify_one();
    }
}

/// A message the broker accepted, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// Publishes remembered by a new [`InMemoryBus`].
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 1024;

#[derive(Debug)]
struct BusState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    /// The most recent publishes, oldest first.
    published: VecDeque<Published>,
    publish_log_capacity: usize,
    next_tag: u64,
    fail_publishes: u32,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            published: VecDeque::new(),
            publish_log_capacity: DEFAULT_PUBLISH_LOG_CAPACITY,
            next_tag: 0,
            fail_publishes: 0,
        }
    }
}

impl BusState {
    fn record_publish(&mut self, published: Published) {
        if self.publish_log_capacity == 0 {
            return;
        }
        while self.published.len() >= self.publish_log_capacity {
            self.published.pop_front();
        }
        self.published.push_back(published);
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))
    }

    fn route(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic_matches(&b.key, routing_key),
                ExchangeKind::Direct => b.key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect();
        // A queue bound twice with overlapping keys still gets one copy.
        targets.sort();
        targets.dedup();
        targets
    }

    fn settle(&mut self, queue: &str, tag: u64) -> Result<Queued> {
        self.queue_mut(queue)?
            .unacked
            .remove(&tag)
            .map(|u| u.queued)
            .ok_or_else(|| BusError::UnknownDelivery {
                queue: queue.to_string(),
                tag,
            })
    }

    fn return_unacked(&mut self, queue: &str, consumer_id: u64) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer_id == consumer_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Oldest first at the head, preserving the original order.
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut queued = unacked.queued;
                queued.delivery_count += 1;
                state.ready.push_front(queued);
            }
        }
        state.notify.notify_one();
    }
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process message broker.
///
/// Behaves like a single-node AMQP broker: topic/direct/fanout exchanges,
/// FIFO queues, manual acknowledgement, requeue to the head of the queue,
/// and per-queue dead-letter queues. The most recent accepted publishes are
/// also kept, up to [`DEFAULT_PUBLISH_LOG_CAPACITY`] unless changed with
/// [`InMemoryBus::with_publish_log_capacity`], so tests can assert what went
/// over the wire.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    next_consumer: Arc<AtomicU64>,
}

impl InMemoryBus {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` publishes for inspection, dropping the oldest.
    /// Zero disables the log.
    pub fn with_publish_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = lock(&self.state);
            state.publish_log_capacity = capacity;
            while state.published.len() > capacity {
                state.published.pop_front();
            }
        }
        self
    }

    /// Makes the next `count` publishes fail as if the broker were down.
    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state).fail_publishes = count;
    }

    /// Messages waiting for delivery on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged on a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Messages sitting in the dead-letter queue of `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Message> {
        let dlq = QueueSpec::dead_letter_name(queue);
        lock(&self.state)
            .queues
            .get(&dlq)
            .map(|q| q.ready.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// The logged publishes, in publish order.
    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.iter().cloned().collect()
    }

    /// Accepted messages published with `routing_key`.
    pub fn published_with_key(&self, routing_key: &str) -> Vec<Published> {
        lock(&self.state)
            .published
            .iter()
            .filter(|p| p.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// True if `queue` has a binding on `exchange` with exactly `key`.
    pub fn has_binding(&self, queue: &str, exchange: &str, key: &str) -> bool {
        lock(&self.state)
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == key)
    }

    /// Number of bindings on the broker.
    pub fn binding_count(&self) -> usize {
        lock(&self.state).bindings.len()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    type Consumer = InMemoryConsumer;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = lock(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::ExchangeKindMismatch {
                name: name.to_string(),
                existing: existing.to_string(),
                requested: kind.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                tracing::debug!(exchange = name, %kind, "exchange declared");
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.queues.contains_key(&spec.name) {
            state
                .queues
                .insert(spec.name.clone(), QueueState::new(spec.clone()));
            tracing::debug!(queue = %spec.name, durable = spec.durable, "queue declared");
        }
        if spec.dead_letter {
            let dlq = QueueSpec::dead_letter_name(&spec.name);
            state.queues.entry(dlq.clone()).or_insert_with(|| {
                QueueState::new(QueueSpec {
                    name: dlq,
                    durable: spec.durable,
                    dead_letter: false,
                })
            });
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::ExchangeNotFound(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                key: binding_key.to_string(),
            });
            tracing::debug!(queue, exchange, binding_key, "queue bound");
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BusError::PublishFailed {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;

        let targets = state.route(exchange, kind, routing_key);
        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "message unroutable, dropped");
        }
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.push_back(Queued {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    delivery_count: 1,
                });
            }
        }
        state.record_publish(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<InMemoryConsumer> {
        let notify = lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;

        Ok(InMemoryConsumer {
            id: self.next_consumer.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_string(),
            state: self.state.clone(),
            notify,
            cancelled: false,
        })
    }
}

/// Consumer handed out by [`InMemoryBus`].
pub struct InMemoryConsumer {
    id: u64,
    queue: String,
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    cancelled: bool,
}

impl InMemoryConsumer {
    fn try_take(&self) -> Option<Delivery> {
        let mut state = lock(&self.state);
        state.next_tag += 1;
        let tag = state.next_tag;
        let queue = state.queues.get_mut(&self.queue)?;
        let queued = queue.ready.pop_front()?;
        let delivery = Delivery {
            tag,
            queue: self.queue.clone(),
            exchange: queued.exchange.clone(),
            routing_key: queued.routing_key.clone(),
            message: queued.message.clone(),
            delivery_count: queued.delivery_count,
        };
        queue.unacked.insert(
            tag,
            Unacked {
                consumer_id: self.id,
                queued,
            },
        );
        Some(delivery)
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.cancelled {
                return None;
            }
            if let Some(delivery) = self.try_take() {
                return Some(delivery);
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        lock(&self.state).settle(&self.queue, delivery.tag)?;
        Ok(())
    }

    async fn requeue(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = lock(&self.state);
        let mut queued = state.settle(&self.queue, delivery.tag)?;
        queued.delivery_count += 1;
        let queue = state.queue_mut(&self.queue)?;
        queue.ready.push_front(queued);
        queue.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let queued = state.settle(&self.queue, delivery.tag)?;
        let dead_letter_enabled = state.queue_mut(&self.queue)?.spec.dead_letter;
        if !dead_letter_enabled {
            tracing::warn!(queue = %self.queue, reason, "no dead-letter queue, message discarded");
            return Ok(());
        }

        let dlq = QueueSpec::dead_letter_name(&self.queue);
        let message = queued
            .message
            .with_header(DEATH_REASON_HEADER, reason)
            .with_header(DEATH_QUEUE_HEADER, self.queue.clone());
        state.queue_mut(&dlq)?.push_back(Queued {
            exchange: queued.exchange,
            routing_key: queued.routing_key,
            message,
            delivery_count: 1,
        });
        Ok(())
    }

    async fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            lock(&self.state).return_unacked(&self.queue, self.id);
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.cancelled {
            lock(&self.state).return_unacked(&self.queue, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bus_with_queue(queue: &str, key: &str) -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.declare_exchange("saga.events", ExchangeKind::Topic)
            .await
            .unwrap();
        bus.declare_queue(&QueueSpec::durable(queue)).await.unwrap();
        bus.bind_queue(queue, "saga.events", key).await.unwrap();
        bus
    }

    fn message(id: &str) -> Message {
        Message::json(id, id.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let bus = bus_with_queue("stock_events", "payment.processed").await;

        bus.publish("saga.events", "payment.processed", message("m1"))
            .await
            .unwrap();
        bus.publish("saga.events", "payment.failed", message("m2"))
            .await
            .unwrap();

        assert_eq!(bus.queue_depth("stock_events"), 1);
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn publish_log_keeps_only_the_most_recent() {
        let bus = bus_with_queue("q", "a.b")
            .await
            .with_publish_log_capacity(2);

        for id in ["m1", "m2", "m3"] {
            bus.publish("saga.events", "a.b", message(id)).await.unwrap();
        }

        let ids: Vec<String> = bus
            .published()
            .into_iter()
            .map(|p| p.message.message_id)
            .collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(bus.queue_depth("q"), 3);
    }

    #[tokio::test]
    async fn publish_log_can_be_disabled() {
        let bus = bus_with_queue("q", "a.b")
            .await
            .with_publish_log_capacity(0);

        bus.publish("saga.events", "a.b", message("m1")).await.unwrap();

        assert!(bus.published().is_empty());
        assert_eq!(bus.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn declarations_are_idempotent() {
        let bus = bus_with_queue("q", "a.b").await;
        bus.declare_exchange("saga.events", ExchangeKind::Topic)
            .await
            .unwrap();
        bus.declare_queue(&QueueSpec::durable("q")).await.unwrap();
        bus.bind_queue("q", "saga.events", "a.b").await.unwrap();

        assert_eq!(bus.binding_count(), 1);
    }

    #[tokio::test]
    async fn redeclaring_exchange_with_other_kind_fails() {
        let bus = bus_with_queue("q", "a.b").await;
        let result = bus
            .declare_exchange("saga.events", ExchangeKind::Fanout)
            .await;
        assert!(matches!(
            result,
            Err(BusError::ExchangeKindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let bus = InMemoryBus::new();
        let result = bus.publish("nowhere", "a", message("m")).await;
        assert!(matches!(result, Err(BusError::ExchangeNotFound(_))));
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_and_acks() {
        let bus = bus_with_queue("q", "#").await;
        for id in ["m1", "m2", "m3"] {
            bus.publish("saga.events", "x", message(id)).await.unwrap();
        }

        let mut consumer = bus.consume("q").await.unwrap();
        for expected in ["m1", "m2", "m3"] {
            let delivery = consumer.next().await.unwrap();
            assert_eq!(delivery.message.message_id, expected);
            consumer.ack(&delivery).await.unwrap();
        }
        assert_eq!(bus.queue_depth("q"), 0);
        assert_eq!(bus.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn requeue_returns_message_to_head_with_count() {
        let bus = bus_with_queue("q", "#").await;
        bus.publish("saga.events", "x", message("m1")).await.unwrap();
        bus.publish("saga.events", "x", message("m2")).await.unwrap();

        let mut consumer = bus.consume("q").await.unwrap();
        let first = consumer.next().await.unwrap();
        consumer.requeue(&first).await.unwrap();

        let again = consumer.next().await.unwrap();
        assert_eq!(again.message.message_id, "m1");
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn dead_letter_moves_message_with_reason() {
        let bus = bus_with_queue("q", "#").await;
        bus.publish("saga.events", "x", message("bad")).await.unwrap();

        let mut consumer = bus.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        consumer
            .dead_letter(&delivery, "not valid JSON")
            .await
            .unwrap();

        let dead = bus.dead_letters("q");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].headers.get(DEATH_REASON_HEADER).map(String::as_str),
            Some("not valid JSON")
        );
        assert_eq!(bus.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let bus = bus_with_queue("q", "#").await;
        bus.publish("saga.events", "x", message("m1")).await.unwrap();

        let mut consumer = bus.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        consumer.ack(&delivery).await.unwrap();
        assert!(matches!(
            consumer.ack(&delivery).await,
            Err(BusError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_consumer_returns_unacked_messages() {
        let bus = bus_with_queue("q", "#").await;
        bus.publish("saga.events", "x", message("m1")).await.unwrap();

        let mut consumer = bus.consume("q").await.unwrap();
        let _in_flight = consumer.next().await.unwrap();
        consumer.cancel().await;

        assert_eq!(bus.queue_depth("q"), 1);
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_consumer_returns_unacked_messages() {
        let bus = bus_with_queue("q", "#").await;
        bus.publish("saga.events", "x", message("m1")).await.unwrap();
        {
            let mut consumer = bus.consume("q").await.unwrap();
            let _ = consumer.next().await.unwrap();
        }
        assert_eq!(bus.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn next_waits_for_publish() {
        let bus = bus_with_queue("q", "#").await;
        let mut consumer = bus.consume("q").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher
                .publish("saga.events", "x", message("late"))
                .await
                .unwrap();
        });

        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.message.message_id, "late");
    }

    #[tokio::test]
    async fn injected_publish_failures_are_not_recorded() {
        let bus = bus_with_queue("q", "#").await;
        bus.fail_next_publishes(1);

        assert!(bus.publish("saga.events", "x", message("m1")).await.is_err());
        bus.publish("saga.events", "x", message("m1")).await.unwrap();

        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.queue_depth("q"), 1);
    }
}
