use async_trait::async_trait;
use common::{OrderId, ProductId};
use contracts::StockItem;
use outbox::OutboxMessage;

use crate::{Product, Result, StockRejection, StockReservation};

/// Result of an all-or-nothing reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Every line was reserved and the outbox row written.
    Reserved(Vec<StockReservation>),

    /// A line asked for more than is on hand. Nothing was written.
    Insufficient {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    /// A line names a product that does not exist. Nothing was written.
    UnknownProduct(ProductId),

    /// A product's merged quantity is zero or above [`MAX_LINE_QUANTITY`].
    /// Nothing was written.
    QuantityOutOfRange(ProductId),

    /// The order already has reservations or a rejection. Nothing was written.
    AlreadyProcessed,
}

/// Persistence for products, reservations and rejections.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Reserves every item for the order, or nothing.
    ///
    /// Each line's sufficiency check and decrement is one conditional update.
    /// On success the reservations and `outbox` commit together.
    async fn reserve_with_outbox(
        &self,
        order_id: &OrderId,
        items: &[StockItem],
        outbox: OutboxMessage,
    ) -> Result<ReserveOutcome>;

    /// Records why the order could not be reserved, with its outbox row.
    ///
    /// Returns false, writing nothing, if the order already has reservations
    /// or a rejection.
    async fn record_rejection_with_outbox(
        &self,
        order_id: &OrderId,
        reason: &str,
        outbox: OutboxMessage,
    ) -> Result<bool>;

    /// Returns the units of `reservations` to stock and marks them released.
    ///
    /// Returns false, writing nothing, if any of them is no longer reserved.
    async fn release_with_outbox(
        &self,
        reservations: &[StockReservation],
        outbox: OutboxMessage,
    ) -> Result<bool>;

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>>;

    /// All products, by id.
    async fn list_products(&self) -> Result<Vec<Product>>;

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<StockReservation>>;

    async fn rejection_for_order(&self, order_id: &OrderId) -> Result<Option<StockRejection>>;

    /// Inserts `products` if the catalogue is empty. Returns how many.
    async fn seed_products(&self, products: &[Product]) -> Result<usize>;
}

/// Largest quantity one reservation row can hold.
pub const MAX_LINE_QUANTITY: u32 = i32::MAX as u32;

/// Folds lines naming the same product into one, keeping first-seen order.
///
/// Fails with the product whose merged quantity is zero or exceeds
/// [`MAX_LINE_QUANTITY`].
pub fn merge_lines(items: &[StockItem]) -> std::result::Result<Vec<StockItem>, ProductId> {
    let mut merged: Vec<StockItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|m| m.product_id == item.product_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(item.quantity)
                    .ok_or_else(|| item.product_id.clone())?;
            }
            None => merged.push(item.clone()),
        }
    }
    match merged
        .iter()
        .find(|m| m.quantity == 0 || m.quantity > MAX_LINE_QUANTITY)
    {
        Some(bad) => Err(bad.product_id.clone()),
        None => Ok(merged),
    }
}
