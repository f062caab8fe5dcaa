use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{OutboxError, OutboxMessage, OutboxStore, Result};

/// Inserts an outbox row inside the caller's transaction.
///
/// The row becomes visible to the relay only when the caller commits, together
/// with the state change it announces.
pub async fn insert_outbox_message(
    tx: &mut Transaction<'_, Postgres>,
    message: &OutboxMessage,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox_messages
            (id, event_id, event_type, event_data, exchange, routing_key, partition_key, source, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(message.id)
    .bind(message.event_id.as_uuid())
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(&message.exchange)
    .bind(&message.routing_key)
    .bind(&message.partition_key)
    .bind(&message.source)
    .bind(message.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// PostgreSQL-backed outbox for one service.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    source: String,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, source: impl Into<String>) -> Self {
        Self {
            pool,
            source: source.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("event_data")?,
            exchange: row.try_get("exchange")?,
            routing_key: row.try_get("routing_key")?,
            partition_key: row.try_get("partition_key")?,
            source: row.try_get("source")?,
            is_processed: row.try_get("is_processed")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            sequence: row.try_get("sequence")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, event_id, event_type, event_data, exchange, routing_key,
                   partition_key, source, is_processed, attempts, last_error, created_at, processed_at
            FROM outbox_messages
            WHERE source = $1 AND NOT is_processed
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(&self.source)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET is_processed = TRUE, processed_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE source = $1 AND is_processed AND processed_at < $2",
        )
        .bind(&self.source)
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_messages WHERE source = $1 AND NOT is_processed",
        )
        .bind(&self.source)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}
