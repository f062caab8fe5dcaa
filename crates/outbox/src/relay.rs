//! Moves committed outbox rows onto the bus.

use std::collections::HashSet;
use std::time::Duration;

use bus::MessageBus;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{OutboxStore, Result};

/// Polling and backoff settings of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Pause between passes when there is nothing to do.
    pub poll_interval: Duration,
    /// Rows fetched per pass.
    pub batch_size: usize,
    /// First delay after a failed pass; doubles on each further failure.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Rows skipped because an earlier row of the same partition failed.
    pub deferred: usize,
}

impl RelayReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Publishes one service's outbox rows.
///
/// Rows are taken oldest first. A row is marked processed only after the
/// broker accepted it; if publishing fails the row stays pending, and later
/// rows with the same partition key wait for the next pass so per-order
/// ordering holds. Other partitions carry on.
pub struct OutboxRelay<O, B> {
    store: O,
    bus: B,
    config: RelayConfig,
}

impl<O, B> OutboxRelay<O, B>
where
    O: OutboxStore + 'static,
    B: MessageBus + 'static,
{
    pub fn new(store: O, bus: B) -> Self {
        Self {
            store,
            bus,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    /// Publishes one batch of pending rows.
    #[tracing::instrument(skip(self), fields(source = %self.store.source()))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let batch = self.store.fetch_unprocessed(self.config.batch_size).await?;
        let mut report = RelayReport {
            fetched: batch.len(),
            ..RelayReport::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();
        let source = self.store.source().to_string();

        for row in batch {
            if blocked.contains(&row.partition_key) {
                report.deferred += 1;
                continue;
            }

            let published = match row.to_bus_message() {
                Ok(message) => self
                    .bus
                    .publish(&row.exchange, &row.routing_key, message)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match published {
                Ok(()) => {
                    self.store.mark_processed(row.id, Utc::now()).await?;
                    report.published += 1;
                    metrics::counter!("outbox_messages_published_total", "source" => source.clone())
                        .increment(1);
                    tracing::debug!(
                        event_id = %row.event_id,
                        event_type = %row.event_type,
                        order_id = %row.partition_key,
                        "outbox message published"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        event_id = %row.event_id,
                        order_id = %row.partition_key,
                        attempts = row.attempts + 1,
                        %error,
                        "outbox publish failed"
                    );
                    self.store.record_failure(row.id, &error).await?;
                    report.failed += 1;
                    metrics::counter!("outbox_publish_failures_total", "source" => source.clone())
                        .increment(1);
                    blocked.insert(row.partition_key);
                }
            }
        }

        Ok(report)
    }

    /// Runs passes until `shutdown` flips. A pass in progress is finished.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        tracing::info!(source = %self.store.source(), "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) if report.is_clean() => {
                    failures = 0;
                    if report.fetched > 0 && report.fetched == self.config.batch_size {
                        // Full batch: more is probably waiting.
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Ok(report) => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    tracing::warn!(failed = report.failed, ?delay, "relay pass had failures, backing off");
                    delay
                }
                Err(err) => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    tracing::error!(error = %err, ?delay, "relay pass failed, backing off");
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(source = %self.store.source(), "outbox relay stopped");
    }

    /// Runs the relay on the runtime until [`RelayHandle::stop`].
    pub fn spawn(self) -> RelayHandle {
        let (shutdown, receiver) = watch::channel(false);
        let source = self.store.source().to_string();
        let join = tokio::spawn(async move { self.run(receiver).await });
        RelayHandle {
            source,
            shutdown,
            join,
        }
    }
}

/// Controls a spawned relay.
pub struct RelayHandle {
    source: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Stops the relay after its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(source = %self.source, error = %err, "relay task failed");
        }
    }
}
