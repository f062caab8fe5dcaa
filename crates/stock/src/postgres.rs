use async_trait::async_trait;
use common::{Money, OrderId, ProductId, ReservationId};
use contracts::StockItem;
use outbox::{OutboxMessage, insert_outbox_message};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Product, ReservationStatus, ReserveOutcome, Result, StockError, StockRejection,
    StockReservation, StockStore, store::merge_lines,
};

/// PostgreSQL-backed stock store.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::new(row.try_get::<String, _>("id")?),
            name: row.try_get("name")?,
            quantity: row.try_get("quantity")?,
            price: Money::from_cents(row.try_get("price_cents")?),
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<StockReservation> {
        let status: String = row.try_get("status")?;
        let status = ReservationStatus::parse(&status)
            .ok_or_else(|| StockError::CorruptState(format!("unknown status '{status}'")))?;
        let quantity: i32 = row.try_get("quantity")?;
        let quantity = u32::try_from(quantity)
            .map_err(|_| StockError::CorruptState(format!("reservation quantity {quantity}")))?;

        Ok(StockReservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            quantity,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn is_processed(tx: &mut Transaction<'_, Postgres>, order_id: &OrderId) -> Result<bool> {
        let processed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM stock_reservations WHERE order_id = $1)
                OR EXISTS (SELECT 1 FROM stock_rejections WHERE order_id = $1)
            "#,
        )
        .bind(order_id.as_str())
        .fetch_one(&mut **tx)
        .await?;

        Ok(processed)
    }

    /// Decrements one line if enough is on hand. `None` means nothing changed.
    async fn take(
        tx: &mut Transaction<'_, Postgres>,
        item: &StockItem,
    ) -> Result<Option<ReserveOutcome>> {
        let updated = sqlx::query(
            r#"
            UPDATE products SET quantity = quantity - $1, updated_at = NOW()
            WHERE id = $2 AND quantity >= $1
            "#,
        )
        .bind(i64::from(item.quantity))
        .bind(item.product_id.as_str())
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(None);
        }

        let available: Option<i64> =
            sqlx::query_scalar("SELECT quantity FROM products WHERE id = $1")
                .bind(item.product_id.as_str())
                .fetch_optional(&mut **tx)
                .await?;

        match available {
            None => Ok(Some(ReserveOutcome::UnknownProduct(item.product_id.clone()))),
            Some(quantity) if quantity < 0 => Err(StockError::NegativeStock {
                product_id: item.product_id.clone(),
                quantity,
            }),
            Some(available) => Ok(Some(ReserveOutcome::Insufficient {
                product_id: item.product_id.clone(),
                requested: item.quantity,
                available,
            })),
        }
    }
}

const SELECT_RESERVATION: &str = r#"
    SELECT id, order_id, product_id, quantity, status, created_at, updated_at
    FROM stock_reservations
"#;

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn reserve_with_outbox(
        &self,
        order_id: &OrderId,
        items: &[StockItem],
        outbox: OutboxMessage,
    ) -> Result<ReserveOutcome> {
        let mut items = match merge_lines(items) {
            Ok(items) => items,
            Err(product_id) => return Ok(ReserveOutcome::QuantityOutOfRange(product_id)),
        };
        // Lock rows in a fixed order so concurrent orders cannot deadlock.
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        let mut tx = self.pool.begin().await?;
        if Self::is_processed(&mut tx, order_id).await? {
            tx.rollback().await?;
            return Ok(ReserveOutcome::AlreadyProcessed);
        }

        let mut reserved = Vec::with_capacity(items.len());
        for item in &items {
            if let Some(refused) = Self::take(&mut tx, item).await? {
                tx.rollback().await?;
                return Ok(refused);
            }

            let reservation =
                StockReservation::new(order_id.clone(), item.product_id.clone(), item.quantity);
            let quantity = i32::try_from(reservation.quantity).map_err(|_| {
                StockError::QuantityOutOfRange {
                    product_id: reservation.product_id.clone(),
                    quantity: reservation.quantity,
                }
            })?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO stock_reservations
                    (id, order_id, product_id, quantity, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.order_id.as_str())
            .bind(reservation.product_id.as_str())
            .bind(quantity)
            .bind(reservation.status.as_str())
            .bind(reservation.created_at)
            .bind(reservation.updated_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => reserved.push(reservation),
                Err(sqlx::Error::Database(ref db_err))
                    if db_err.constraint() == Some("unique_reservation_order_product") =>
                {
                    // A concurrent delivery of the same order got here first.
                    tx.rollback().await?;
                    return Ok(ReserveOutcome::AlreadyProcessed);
                }
                Err(e) => return Err(e.into()),
            }
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(ReserveOutcome::Reserved(reserved))
    }

    async fn record_rejection_with_outbox(
        &self,
        order_id: &OrderId,
        reason: &str,
        outbox: OutboxMessage,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if Self::is_processed(&mut tx, order_id).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO stock_rejections (order_id, reason)
            VALUES ($1, $2)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_str())
        .bind(reason)
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

    async fn release_with_outbox(
        &self,
        reservations: &[StockReservation],
        outbox: OutboxMessage,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        for reservation in reservations {
            let released = sqlx::query(
                r#"
                UPDATE stock_reservations SET status = $2, updated_at = NOW()
                WHERE id = $1 AND status = $3
                "#,
            )
            .bind(reservation.id.as_uuid())
            .bind(ReservationStatus::Released.as_str())
            .bind(ReservationStatus::Reserved.as_str())
            .execute(&mut *tx)
            .await?;

            if released.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            let restored = sqlx::query(
                "UPDATE products SET quantity = quantity + $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(i64::from(reservation.quantity))
            .bind(reservation.product_id.as_str())
            .execute(&mut *tx)
            .await?;

            if restored.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(StockError::CorruptState(format!(
                    "reservation {} references missing product {}",
                    reservation.id, reservation.product_id
                )));
            }
        }

        insert_outbox_message(&mut tx, &outbox).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT id, name, quantity, price_cents FROM products WHERE id = $1")
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_product).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        let rows = sqlx::query("SELECT id, name, quantity, price_cents FROM products ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_product).collect()
    }

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<StockReservation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_RESERVATION} WHERE order_id = $1 ORDER BY product_id"
        ))
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    async fn rejection_for_order(&self, order_id: &OrderId) -> Result<Option<StockRejection>> {
        let row = sqlx::query(
            "SELECT order_id, reason, created_at FROM stock_rejections WHERE order_id = $1",
        )
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(StockRejection {
                order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
                reason: row.try_get("reason")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn seed_products(&self, products: &[Product]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        // Serialize concurrent seeders.
        sqlx::query("LOCK TABLE products IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            tx.rollback().await?;
            return Ok(0);
        }

        for product in products {
            sqlx::query(
                "INSERT INTO products (id, name, quantity, price_cents) VALUES ($1, $2, $3, $4)",
            )
            .bind(product.id.as_str())
            .bind(&product.name)
            .bind(product.quantity)
            .bind(product.price.cents())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(products.len())
    }
}
