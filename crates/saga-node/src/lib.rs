//! Process wiring for the order saga.
//!
//! A node declares the `saga.events` topology, then starts every participant:
//! an [`OutboxRelay`] draining the participant's outbox and a [`QueueWorker`]
//! feeding its queue to its handler. Participants share nothing but the bus.
//! [`Node::shutdown`] lets each worker finish the message in hand before the
//! relays stop.

pub mod config;
pub mod error;

use std::net::SocketAddr;
use std::sync::Arc;

use bus::{
    MessageBus, MessageHandler, ORDER_QUEUE, PAYMENT_QUEUE, QueueWorker, STOCK_QUEUE, Topology,
    WorkerGroup, WorkerStats,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use order::{InMemoryOrderStore, OrderService, OrderStore, PostgresOrderStore};
use outbox::{OutboxRelay, OutboxStore, PostgresOutboxStore, RelayHandle};
use payment::{InMemoryPaymentStore, PaymentGateway, PaymentHandler, PostgresPaymentStore};
use sqlx::PgPool;
use stock::{InMemoryStockStore, PostgresStockStore, StockHandler, StockStore, demo_catalogue};

pub use config::{Config, LogFormat};
pub use error::{NodeError, Result};

/// SQL applied, in order, when the node runs against PostgreSQL.
/// Every statement is idempotent.
pub const SCHEMA: [&str; 4] = [
    include_str!("../../../migrations/001_create_outbox_messages.sql"),
    include_str!("../../../migrations/002_create_payments.sql"),
    include_str!("../../../migrations/003_create_stock_tables.sql"),
    include_str!("../../../migrations/004_create_orders.sql"),
];

/// Installs the Prometheus recorder with an HTTP listener on `addr`.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "outbox_messages_published_total",
        "Outbox rows handed to the broker"
    );
    metrics::describe_counter!(
        "outbox_publish_failures_total",
        "Outbox publish attempts the broker refused"
    );
    metrics::describe_counter!(
        "bus_messages_dead_lettered_total",
        "Deliveries moved to a dead-letter queue"
    );
    metrics::describe_counter!(
        "bus_messages_requeued_total",
        "Deliveries requeued after a transient failure"
    );
    metrics::describe_histogram!(
        "saga_handler_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent handling one delivery"
    );
    metrics::describe_counter!("saga_orders_placed_total", "Orders accepted");
    metrics::describe_counter!("saga_orders_confirmed_total", "Orders confirmed");
    metrics::describe_counter!("saga_orders_cancelled_total", "Orders cancelled");
    metrics::describe_counter!("saga_payments_completed_total", "Charges that succeeded");
    metrics::describe_counter!("saga_payments_failed_total", "Charges that failed");
    metrics::describe_counter!("saga_payments_refunded_total", "Payments refunded");
    metrics::describe_counter!("saga_stock_reserved_total", "Orders whose stock was reserved");
    metrics::describe_counter!("saga_stock_rejected_total", "Orders refused for lack of stock");
}

/// Connects to PostgreSQL and applies [`SCHEMA`].
pub async fn connect_postgres(url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await?;
    for sql in SCHEMA {
        sqlx::raw_sql(sql).execute(&pool).await?;
    }
    tracing::info!("database schema applied");
    Ok(pool)
}

/// Starts participants one at a time on a shared bus.
pub struct NodeBuilder<B> {
    bus: B,
    config: Config,
    workers: WorkerGroup,
    relays: Vec<RelayHandle>,
}

impl<B: MessageBus + Clone + 'static> NodeBuilder<B> {
    /// Declares the saga topology on `bus`.
    pub async fn new(bus: B, config: Config) -> Result<Self> {
        Topology::saga().declare(&bus).await?;
        Ok(Self {
            bus,
            config,
            workers: WorkerGroup::new(),
            relays: Vec::new(),
        })
    }

    /// Spawns a relay for `outbox` and a worker feeding `queue` to `handler`.
    pub fn participant<H, O>(mut self, queue: &str, handler: Arc<H>, outbox: O) -> Self
    where
        H: MessageHandler,
        O: OutboxStore + 'static,
    {
        self.relays.push(
            OutboxRelay::new(outbox, self.bus.clone())
                .with_config(self.config.relay)
                .spawn(),
        );
        self.workers.push(
            QueueWorker::new(self.bus.clone(), queue, handler)
                .with_policy(self.config.retry)
                .spawn(),
        );
        tracing::info!(%queue, "participant started");
        self
    }

    pub fn finish<S: OrderStore + 'static>(self, orders: Arc<OrderService<S>>) -> Node<S> {
        Node {
            orders,
            workers: self.workers,
            relays: self.relays,
        }
    }
}

/// A running set of participants.
pub struct Node<S> {
    orders: Arc<OrderService<S>>,
    workers: WorkerGroup,
    relays: Vec<RelayHandle>,
}

impl<S: OrderStore + 'static> Node<S> {
    /// Entry point of the saga: place and query orders.
    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    /// Stops the workers, each after settling its in-flight message, then
    /// the relays after their current pass.
    pub async fn shutdown(self) -> Vec<(String, WorkerStats)> {
        let stats = self.workers.stop_all().await;
        for relay in self.relays {
            relay.stop().await;
        }
        for (queue, s) in &stats {
            tracing::info!(
                %queue,
                handled = s.handled,
                dead_lettered = s.dead_lettered,
                "worker drained"
            );
        }
        stats
    }
}

async fn seed<T: StockStore>(store: &T, config: &Config) -> Result<()> {
    if config.seed_products {
        let inserted = store.seed_products(&demo_catalogue()).await?;
        if inserted > 0 {
            tracing::info!(products = inserted, "product catalogue seeded");
        }
    }
    Ok(())
}

/// Stores of a database-less node. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStores {
    pub orders: Arc<InMemoryOrderStore>,
    pub payments: Arc<InMemoryPaymentStore>,
    pub stock: Arc<InMemoryStockStore>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Starts every participant over in-memory stores.
pub async fn start_in_memory<B, G>(
    config: Config,
    bus: B,
    stores: &InMemoryStores,
    gateway: Arc<G>,
) -> Result<Node<InMemoryOrderStore>>
where
    B: MessageBus + Clone + 'static,
    G: PaymentGateway + 'static,
{
    seed(stores.stock.as_ref(), &config).await?;

    let payments = Arc::new(PaymentHandler::new(
        stores.payments.clone(),
        gateway,
        config.payment,
    ));
    let reservations = Arc::new(StockHandler::new(stores.stock.clone(), config.stock));
    let orders = Arc::new(OrderService::new(stores.orders.clone()));

    let node = NodeBuilder::new(bus, config)
        .await?
        .participant(PAYMENT_QUEUE, payments, stores.payments.outbox())
        .participant(STOCK_QUEUE, reservations, stores.stock.outbox())
        .participant(ORDER_QUEUE, orders.clone(), stores.orders.outbox())
        .finish(orders);
    Ok(node)
}

/// Starts every participant over PostgreSQL.
pub async fn start_postgres<B, G>(
    config: Config,
    bus: B,
    pool: PgPool,
    gateway: Arc<G>,
) -> Result<Node<PostgresOrderStore>>
where
    B: MessageBus + Clone + 'static,
    G: PaymentGateway + 'static,
{
    let stock_store = Arc::new(PostgresStockStore::new(pool.clone()));
    seed(stock_store.as_ref(), &config).await?;

    let payments = Arc::new(PaymentHandler::new(
        Arc::new(PostgresPaymentStore::new(pool.clone())),
        gateway,
        config.payment,
    ));
    let reservations = Arc::new(StockHandler::new(stock_store, config.stock));
    let orders = Arc::new(OrderService::new(Arc::new(PostgresOrderStore::new(
        pool.clone(),
    ))));

    let node = NodeBuilder::new(bus, config)
        .await?
        .participant(
            PAYMENT_QUEUE,
            payments,
            PostgresOutboxStore::new(pool.clone(), payment::SOURCE),
        )
        .participant(
            STOCK_QUEUE,
            reservations,
            PostgresOutboxStore::new(pool.clone(), stock::SOURCE),
        )
        .participant(
            ORDER_QUEUE,
            orders.clone(),
            PostgresOutboxStore::new(pool, order::SOURCE),
        )
        .finish(orders);
    Ok(node)
}
