//! Supervised queue consumption.
//!
//! A [`QueueWorker`] owns one consumer on one queue and hands deliveries to a
//! [`MessageHandler`] one at a time. The handler's error decides what happens
//! to the message:
//!
//! | class                 | disposition                                  |
//! |-----------------------|----------------------------------------------|
//! | `MalformedEvent`      | dead-lettered, never retried                 |
//! | `TransientInfra`      | requeued after backoff, dead-lettered once   |
//! |                       | the attempt budget is spent                  |
//! | `BusinessRejection`   | acknowledged (the rejection is already       |
//! |                       | recorded and announced)                      |
//! | `InvariantViolation`  | logged at error level and dead-lettered      |
//!
//! On shutdown the worker finishes the message in hand, settles it, and
//! returns any unacknowledged deliveries to the queue.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{Consumer, Delivery, MessageBus};

/// How a handler failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The body cannot be understood. Retrying will not help.
    MalformedEvent,
    /// Database or broker trouble. Worth retrying.
    TransientInfra,
    /// The domain said no. The outcome has been persisted.
    BusinessRejection,
    /// State that must never exist was observed.
    InvariantViolation,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::MalformedEvent => "malformed_event",
            ErrorClass::TransientInfra => "transient_infra",
            ErrorClass::BusinessRejection => "business_rejection",
            ErrorClass::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error to its [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Handles deliveries from one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    /// Processes a delivery. Must be safe to call again with the same
    /// message: every message may arrive more than once.
    async fn handle(&self, delivery: &Delivery) -> Result<(), Self::Error>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries allowed before a transiently failing message is
    /// dead-lettered.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub handled: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// One consumption loop bound to one queue.
pub struct QueueWorker<B, H> {
    bus: B,
    queue: String,
    handler: std::sync::Arc<H>,
    policy: RetryPolicy,
}

impl<B, H> QueueWorker<B, H>
where
    B: MessageBus + Clone + 'static,
    H: MessageHandler,
{
    pub fn new(bus: B, queue: impl Into<String>, handler: std::sync::Arc<H>) -> Self {
        Self {
            bus,
            queue: queue.into(),
            handler,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs the worker on the runtime until [`WorkerHandle::stop`].
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let queue = self.queue.clone();
        let join = tokio::spawn(self.run(receiver));
        WorkerHandle {
            queue,
            shutdown,
            join,
        }
    }

    /// Consumes until `shutdown` turns true or its sender is dropped.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();

        let Some(mut consumer) = self.subscribe(&mut shutdown).await else {
            return stats;
        };
        tracing::info!("worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = consumer.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.process(&mut consumer, delivery, &mut shutdown, &mut stats)
                .await;
        }

        consumer.cancel().await;
        tracing::info!(
            handled = stats.handled,
            dead_lettered = stats.dead_lettered,
            "worker stopped"
        );
        stats
    }

    async fn subscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<B::Consumer> {
        let mut attempt = 0;
        loop {
            match self.bus.consume(&self.queue).await {
                Ok(consumer) => return Some(consumer),
                Err(err) => {
                    attempt += 1;
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(error = %err, attempt, ?delay, "consume failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        consumer: &mut B::Consumer,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut WorkerStats,
    ) {
        let queue = self.queue.clone();
        let started = Instant::now();
        let outcome = self.handler.handle(&delivery).await;
        metrics::histogram!("saga_handler_duration_seconds", "queue" => queue.clone())
            .record(started.elapsed().as_secs_f64());
        stats.handled += 1;

        let settled = match outcome {
            Ok(()) => {
                stats.acked += 1;
                consumer.ack(&delivery).await
            }
            Err(err) => match err.class() {
                ErrorClass::BusinessRejection => {
                    tracing::warn!(
                        message_id = %delivery.message.message_id,
                        reason = %err,
                        "business rejection"
                    );
                    stats.rejected += 1;
                    consumer.ack(&delivery).await
                }
                ErrorClass::MalformedEvent => {
                    tracing::warn!(
                        message_id = %delivery.message.message_id,
                        error = %err,
                        "malformed event, dead-lettering"
                    );
                    self.dead_letter(consumer, &delivery, &err.to_string(), stats)
                        .await
                }
                ErrorClass::InvariantViolation => {
                    tracing::error!(
                        message_id = %delivery.message.message_id,
                        error = %err,
                        "invariant violation, dead-lettering"
                    );
                    self.dead_letter(consumer, &delivery, &err.to_string(), stats)
                        .await
                }
                ErrorClass::TransientInfra if delivery.delivery_count >= self.policy.max_attempts => {
                    tracing::error!(
                        message_id = %delivery.message.message_id,
                        attempts = delivery.delivery_count,
                        error = %err,
                        "retries exhausted, dead-lettering"
                    );
                    let reason = format!("retries exhausted: {err}");
                    self.dead_letter(consumer, &delivery, &reason, stats).await
                }
                ErrorClass::TransientInfra => {
                    let delay = self.policy.backoff(delivery.delivery_count);
                    tracing::warn!(
                        message_id = %delivery.message.message_id,
                        attempt = delivery.delivery_count,
                        ?delay,
                        error = %err,
                        "transient failure, requeueing"
                    );
                    // Leave the backoff early on shutdown; the message goes back either way.
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    stats.requeued += 1;
                    metrics::counter!("bus_messages_requeued_total", "queue" => queue.clone())
                        .increment(1);
                    consumer.requeue(&delivery).await
                }
            },
        };

        if let Err(err) = settled {
            tracing::error!(
                message_id = %delivery.message.message_id,
                error = %err,
                "failed to settle delivery"
            );
        }
    }

    async fn dead_letter(
        &self,
        consumer: &mut B::Consumer,
        delivery: &Delivery,
        reason: &str,
        stats: &mut WorkerStats,
    ) -> crate::Result<()> {
        stats.dead_lettered += 1;
        metrics::counter!("bus_messages_dead_lettered_total", "queue" => self.queue.clone())
            .increment(1);
        consumer.dead_letter(delivery, reason).await
    }
}

/// Controls a spawned [`QueueWorker`].
pub struct WorkerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Asks the worker to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the worker and waits for the in-flight message to settle.
    pub async fn stop(self) -> WorkerStats {
        self.signal();
        self.join().await
    }

    async fn join(self) -> WorkerStats {
        match self.join.await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!(queue = %self.queue, error = %err, "worker task failed");
                WorkerStats::default()
            }
        }
    }
}

/// The workers of one process.
#[derive(Default)]
pub struct WorkerGroup {
    workers: Vec<WorkerHandle>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: WorkerHandle) {
        self.workers.push(handle);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signals every worker at once, then waits for all of them.
    pub async fn stop_all(self) -> Vec<(String, WorkerStats)> {
        for worker in &self.workers {
            worker.signal();
        }
        join_all(self.workers.into_iter().map(|worker| async move {
            let queue = worker.queue.clone();
            (queue, worker.join().await)
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn error_class_names() {
        assert_eq!(ErrorClass::TransientInfra.to_string(), "transient_infra");
        assert_eq!(ErrorClass::MalformedEvent.as_str(), "malformed_event");
    }
}
