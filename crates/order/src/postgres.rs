use async_trait::async_trait;
use common::{CustomerId, Money, OrderId};
use contracts::OrderLine;
use outbox::{OutboxMessage, insert_outbox_message};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::store::check_settlement;
use crate::{Order, OrderError, OrderStatus, OrderStore, Result};

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let status = OrderStatus::parse(&status)
            .ok_or_else(|| OrderError::CorruptState(format!("unknown status '{status}'")))?;
        let items: Vec<OrderLine> = serde_json::from_value(row.try_get("items")?)
            .map_err(|e| OrderError::CorruptState(format!("unreadable items: {e}")))?;

        Ok(Order {
            id: OrderId::new(row.try_get::<String, _>("id")?),
            customer_id: CustomerId::new(row.try_get::<String, _>("customer_id")?),
            total_amount: Money::from_cents(row.try_get("total_amount_cents")?),
            items,
            status,
            cancellation_reason: row.try_get("cancellation_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const SELECT_ORDER: &str = r#"
    SELECT id, customer_id, total_amount_cents, items, status, cancellation_reason,
           created_at, updated_at
    FROM orders
"#;

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create_with_outbox(&self, order: &Order, outbox: OutboxMessage) -> Result<()> {
        let items = serde_json::to_value(&order.items)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, total_amount_cents, items, status,
                                cancellation_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(order.id.as_str())
        .bind(order.customer_id.as_str())
        .bind(order.total_amount.cents())
        .bind(items)
        .bind(order.status.as_str())
        .bind(order.cancellation_reason.as_deref())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(OrderError::AlreadyExists(order.id.clone()));
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn settle_with_outbox(
        &self,
        order_id: &OrderId,
        to: OrderStatus,
        reason: Option<&str>,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        check_settlement(to)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, cancellation_reason = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'Created'
            "#,
        )
        .bind(order_id.as_str())
        .bind(to.as_str())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE id = $1)")
                    .bind(order_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            if !exists {
                return Err(OrderError::NotFound(order_id.clone()));
            }
            return Ok(false);
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("{SELECT_ORDER} WHERE id = $1"))
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn list_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!("{SELECT_ORDER} ORDER BY created_at ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }
}
