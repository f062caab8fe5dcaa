//! Products, reservations and rejections.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

/// A sellable product and its stock level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Units on hand. Never negative.
    pub quantity: i64,
    pub price: Money,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, quantity: i64, price: Money) -> Self {
        Self {
            id: ProductId::new(id),
            name: name.into(),
            quantity,
            price,
        }
    }
}

/// Status of a reservation line.
///
/// ```text
/// Reserved ──► Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Units taken from stock for the order.
    Reserved,

    /// Units given back after the order was cancelled (terminal).
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "Reserved",
            ReservationStatus::Released => "Released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Reserved" => Some(ReservationStatus::Reserved),
            "Released" => Some(ReservationStatus::Released),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Units of one product held for one order.
///
/// At most one exists per (order, product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockReservation {
    pub fn new(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: ReservationId::new(),
            order_id,
            product_id,
            quantity,
            status: ReservationStatus::Reserved,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Why an order's stock could not be reserved. One per order at most, and
/// never alongside reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRejection {
    pub order_id: OrderId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
