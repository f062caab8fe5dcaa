use async_trait::async_trait;
use common::{CustomerId, Money, OrderId, PaymentId};
use outbox::{OutboxMessage, insert_outbox_message};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::store::check_transition;
use crate::{Payment, PaymentError, PaymentStatus, PaymentStore, Result};

/// PostgreSQL-backed payment store.
#[derive(Clone)]
pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        let status: String = row.try_get("status")?;
        let status = PaymentStatus::parse(&status)
            .ok_or_else(|| PaymentError::CorruptState(format!("unknown status '{status}'")))?;

        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
            customer_id: CustomerId::new(row.try_get::<String, _>("customer_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const SELECT_PAYMENT: &str = r#"
    SELECT id, order_id, customer_id, amount_cents, status, created_at, updated_at
    FROM payments
"#;

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn create_with_outbox(&self, payment: &Payment, outbox: OutboxMessage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, customer_id, amount_cents, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ON CONSTRAINT unique_payment_order DO NOTHING
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_str())
        .bind(payment.customer_id.as_str())
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn transition_with_outbox(
        &self,
        payment_id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        check_transition(from, to)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE payments SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(payment_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payments WHERE id = $1)")
                    .bind(payment_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            if !exists {
                return Err(PaymentError::NotFound(payment_id));
            }
            return Ok(false);
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!("{SELECT_PAYMENT} WHERE id = $1"))
            .bind(payment_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn payment_for_order(&self, order_id: &OrderId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!("{SELECT_PAYMENT} WHERE order_id = $1"))
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn list_payments(&self) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!("{SELECT_PAYMENT} ORDER BY created_at ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_payment).collect()
    }
}
