use bus::BusError;
use metrics_exporter_prometheus::BuildError;
use stock::StockError;
use thiserror::Error;

/// Errors that stop the node from starting.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The broker topology could not be declared.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The database could not be reached or its schema applied.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The product catalogue could not be seeded.
    #[error("Stock error: {0}")]
    Stock(#[from] StockError),

    /// The Prometheus exporter could not be installed.
    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] BuildError),
}

/// Result type for node startup.
pub type Result<T> = std::result::Result<T, NodeError>;
