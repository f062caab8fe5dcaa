//! The order entity, its state machine and the command that creates it.

use chrono::{DateTime, Utc};
use common::{CustomerId, Money, OrderId};
use contracts::OrderLine;
use serde::{Deserialize, Serialize};

use crate::{OrderError, Result};

/// The state of an order in the saga.
///
/// ```text
/// Created ──┬──► Confirmed
///           └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Placed, waiting for payment and stock.
    #[default]
    Created,

    /// Paid and reserved (terminal).
    Confirmed,

    /// Payment or stock failed (terminal).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Created, OrderStatus::Confirmed)
                | (OrderStatus::Created, OrderStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Created" => Some(OrderStatus::Created),
            "Confirmed" => Some(OrderStatus::Confirmed),
            "Cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Command to place a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderLine>,
}

impl PlaceOrder {
    pub fn new(order_id: OrderId, customer_id: CustomerId, items: Vec<OrderLine>) -> Self {
        Self {
            order_id,
            customer_id,
            items,
        }
    }

    /// Places an order under a freshly generated id.
    pub fn for_customer(customer_id: CustomerId, items: Vec<OrderLine>) -> Self {
        Self::new(OrderId::generate(), customer_id, items)
    }

    /// Checks every line and returns the order total.
    pub fn validate(&self) -> Result<Money> {
        if self.customer_id.as_str().trim().is_empty() {
            return Err(OrderError::CustomerIdRequired);
        }
        if self.items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut total = Money::zero();
        for line in &self.items {
            if line.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: line.product_id.clone(),
                    quantity: line.quantity,
                });
            }
            if !line.price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    product_id: line.product_id.clone(),
                    price: line.price,
                });
            }
            total = line
                .price
                .checked_mul(line.quantity)
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or(OrderError::TotalOverflow)?;
        }
        Ok(total)
    }
}

/// An order placed by a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: CustomerId,
    /// Sum of price × quantity over the lines.
    pub total_amount: Money,
    pub items: Vec<OrderLine>,
    pub status: OrderStatus,
    /// Set when the order is cancelled.
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Validates `command` and builds the order in `Created`.
    pub fn place(command: PlaceOrder) -> Result<Self> {
        let total_amount = command.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: command.order_id,
            customer_id: command.customer_id,
            total_amount,
            items: command.items,
            status: OrderStatus::Created,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        })
    }
}
