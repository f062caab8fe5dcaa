use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{OutboxMessage, Result};

/// Relay-side access to one service's outbox.
///
/// Rows are inserted by the owning service inside its own transactions; this
/// trait only reads pending rows and records what happened when publishing
/// them.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// The service whose rows this store sees.
    fn source(&self) -> &str;

    /// Oldest unprocessed rows first, at most `limit` of them.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks a row published. Only called after the broker confirmed it.
    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()>;

    /// Counts a failed publish attempt and keeps the row pending.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()>;

    /// Deletes processed rows published before `before`. Returns how many.
    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Number of rows still waiting to be published.
    async fn pending_count(&self) -> Result<u64>;
}
