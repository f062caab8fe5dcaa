use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{OutboxError, OutboxMessage, OutboxStore, Result};

/// Outbox rows held in memory.
///
/// Participant stores embed a table in the same state they guard with one
/// lock, so a domain mutation and its outbox row commit together.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    rows: Vec<OutboxMessage>,
    next_sequence: i64,
}

impl OutboxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row, assigning its sequence number.
    pub fn push(&mut self, mut message: OutboxMessage) {
        self.next_sequence += 1;
        message.sequence = self.next_sequence;
        self.rows.push(message);
    }

    pub fn fetch_unprocessed(&self, source: &str, limit: usize) -> Vec<OutboxMessage> {
        self.rows
            .iter()
            .filter(|m| !m.is_processed && m.source == source)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn mark_processed(&mut self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()> {
        let row = self.row_mut(id)?;
        row.is_processed = true;
        row.processed_at = Some(processed_at);
        Ok(())
    }

    pub fn record_failure(&mut self, id: Uuid, error: &str) -> Result<()> {
        let row = self.row_mut(id)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    pub fn purge_processed(&mut self, before: DateTime<Utc>) -> u64 {
        let len = self.rows.len();
        self.rows
            .retain(|m| !(m.is_processed && m.processed_at.is_some_and(|at| at < before)));
        (len - self.rows.len()) as u64
    }

    pub fn pending(&self) -> usize {
        self.rows.iter().filter(|m| !m.is_processed).count()
    }

    /// Every row, processed or not, in insertion order.
    pub fn rows(&self) -> &[OutboxMessage] {
        &self.rows
    }

    fn row_mut(&mut self, id: Uuid) -> Result<&mut OutboxMessage> {
        self.rows
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(OutboxError::NotFound(id))
    }
}

impl AsMut<OutboxTable> for OutboxTable {
    fn as_mut(&mut self) -> &mut OutboxTable {
        self
    }
}

/// [`OutboxStore`] over state shared with an in-memory participant store.
///
/// `S` is the participant's whole state; the relay locks the same mutex the
/// participant writes through.
pub struct InMemoryOutbox<S = OutboxTable> {
    state: Arc<Mutex<S>>,
    source: String,
}

impl<S> Clone for InMemoryOutbox<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            source: self.source.clone(),
        }
    }
}

impl<S> InMemoryOutbox<S>
where
    S: AsMut<OutboxTable> + Send + 'static,
{
    pub fn new(state: Arc<Mutex<S>>, source: impl Into<String>) -> Self {
        Self {
            state,
            source: source.into(),
        }
    }

    /// Snapshot of every row.
    pub async fn rows(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.as_mut().rows().to_vec()
    }
}

impl InMemoryOutbox<OutboxTable> {
    /// A standalone outbox with its own table.
    pub fn standalone(source: impl Into<String>) -> Self {
        Self::new(Arc::new(Mutex::new(OutboxTable::new())), source)
    }

    /// Appends a row directly.
    pub async fn push(&self, message: OutboxMessage) {
        self.state.lock().await.push(message);
    }
}

#[async_trait]
impl<S> OutboxStore for InMemoryOutbox<S>
where
    S: AsMut<OutboxTable> + Send + 'static,
{
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        Ok(self
            .state
            .lock()
            .await
            .as_mut()
            .fetch_unprocessed(&self.source, limit))
    }

    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()> {
        self.state.lock().await.as_mut().mark_processed(id, processed_at)
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        self.state.lock().await.as_mut().record_failure(id, error)
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64> {
        Ok(self.state.lock().await.as_mut().purge_processed(before))
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.as_mut().pending() as u64)
    }
}
