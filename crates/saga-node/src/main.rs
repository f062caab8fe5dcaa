//! Saga node entry point.

use std::sync::Arc;

use bus::InMemoryBus;
use order::OrderStore;
use payment::SimulatedGateway;
use saga_node::{Config, InMemoryStores, LogFormat, Node, NodeError};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run_until_signal<S: OrderStore + 'static>(node: Node<S>) {
    shutdown_signal().await;
    node.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(config.log_format);

    // 2. Prometheus exporter, when asked for
    if let Some(addr) = config.metrics_addr {
        saga_node::install_metrics_exporter(addr)?;
    }

    // 3. Participants on an in-process broker
    let bus = InMemoryBus::new();
    let gateway = Arc::new(SimulatedGateway::new(config.payment_latency));

    match config.database_url.clone() {
        Some(url) => {
            tracing::info!("starting saga node on PostgreSQL");
            let pool = saga_node::connect_postgres(&url).await?;
            let node = saga_node::start_postgres(config, bus, pool.clone(), gateway).await?;
            run_until_signal(node).await;
            pool.close().await;
        }
        None => {
            tracing::info!("starting saga node with in-memory stores");
            let stores = InMemoryStores::new();
            let node = saga_node::start_in_memory(config, bus, &stores, gateway).await?;
            run_until_signal(node).await;
        }
    }

    tracing::info!("saga node shut down gracefully");
    Ok(())
}
