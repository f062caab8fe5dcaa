//! Saga event variants and their payloads.

use common::{CustomerId, Money, OrderId, PaymentId, ProductId};
use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;
use crate::topics;

/// One product line of an order, as placed by the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: Money,
}

/// One product line to reserve or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl From<&OrderLine> for StockItem {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            quantity: line.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    #[serde(alias = "amount")]
    pub total_amount: Money,
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: String,
}

/// Emitted by the payment service for itself once a payment row exists; the
/// charge happens when this event comes back from the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequested {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProcessed {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub status: String,
    pub items: Vec<StockItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    pub order_id: OrderId,
    pub items: Vec<StockItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationFailed {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReleased {
    pub order_id: OrderId,
    pub items: Vec<StockItem>,
}

/// The closed set of events exchanged by the saga participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum SagaEvent {
    OrderCreated(OrderCreated),
    OrderConfirmed(OrderConfirmed),
    OrderCancelled(OrderCancelled),
    PaymentRequested(PaymentRequested),
    PaymentProcessed(PaymentProcessed),
    PaymentFailed(PaymentFailed),
    PaymentRefunded(PaymentRefunded),
    StockReserved(StockReserved),
    StockReservationFailed(StockReservationFailed),
    StockReleased(StockReleased),
}

impl SagaEvent {
    /// Every `eventType` this version of the contracts understands.
    pub const KNOWN_TYPES: [&'static str; 10] = [
        "OrderCreated",
        "OrderConfirmed",
        "OrderCancelled",
        "PaymentRequested",
        "PaymentProcessed",
        "PaymentFailed",
        "PaymentRefunded",
        "StockReserved",
        "StockReservationFailed",
        "StockReleased",
    ];

    /// Returns true if `event_type` names a variant of this set.
    pub fn is_known_type(event_type: &str) -> bool {
        Self::KNOWN_TYPES.contains(&event_type)
    }

    /// The `eventType` discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => "OrderCreated",
            SagaEvent::OrderConfirmed(_) => "OrderConfirmed",
            SagaEvent::OrderCancelled(_) => "OrderCancelled",
            SagaEvent::PaymentRequested(_) => "PaymentRequested",
            SagaEvent::PaymentProcessed(_) => "PaymentProcessed",
            SagaEvent::PaymentFailed(_) => "PaymentFailed",
            SagaEvent::PaymentRefunded(_) => "PaymentRefunded",
            SagaEvent::StockReserved(_) => "StockReserved",
            SagaEvent::StockReservationFailed(_) => "StockReservationFailed",
            SagaEvent::StockReleased(_) => "StockReleased",
        }
    }

    /// The routing key the event is published with.
    pub fn routing_key(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => topics::ORDER_CREATED,
            SagaEvent::OrderConfirmed(_) => topics::ORDER_CONFIRMED,
            SagaEvent::OrderCancelled(_) => topics::ORDER_CANCELLED,
            SagaEvent::PaymentRequested(_) => topics::PAYMENT_REQUESTED,
            SagaEvent::PaymentProcessed(_) => topics::PAYMENT_PROCESSED,
            SagaEvent::PaymentFailed(_) => topics::PAYMENT_FAILED,
            SagaEvent::PaymentRefunded(_) => topics::PAYMENT_REFUNDED,
            SagaEvent::StockReserved(_) => topics::STOCK_RESERVED,
            SagaEvent::StockReservationFailed(_) => topics::STOCK_RESERVATION_FAILED,
            SagaEvent::StockReleased(_) => topics::STOCK_RELEASED,
        }
    }

    /// The order the event belongs to; used as the outbox partition key.
    pub fn order_id(&self) -> &OrderId {
        match self {
            SagaEvent::OrderCreated(e) => &e.order_id,
            SagaEvent::OrderConfirmed(e) => &e.order_id,
            SagaEvent::OrderCancelled(e) => &e.order_id,
            SagaEvent::PaymentRequested(e) => &e.order_id,
            SagaEvent::PaymentProcessed(e) => &e.order_id,
            SagaEvent::PaymentFailed(e) => &e.order_id,
            SagaEvent::PaymentRefunded(e) => &e.order_id,
            SagaEvent::StockReserved(e) => &e.order_id,
            SagaEvent::StockReservationFailed(e) => &e.order_id,
            SagaEvent::StockReleased(e) => &e.order_id,
        }
    }

    /// Checks the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        let event_type = self.event_type();
        match self {
            SagaEvent::OrderCreated(e) => {
                require_positive(event_type, "totalAmount", e.total_amount)?;
                require_order_lines(event_type, &e.items)
            }
            SagaEvent::PaymentRequested(e) => {
                require_positive(event_type, "amount", e.amount)?;
                require_order_lines(event_type, &e.items)
            }
            SagaEvent::PaymentProcessed(e) => {
                require_positive(event_type, "amount", e.amount)?;
                require_stock_items(event_type, &e.items)
            }
            SagaEvent::PaymentRefunded(e) => require_positive(event_type, "amount", e.amount),
            SagaEvent::StockReserved(e) => require_stock_items(event_type, &e.items),
            SagaEvent::StockReleased(e) => require_stock_items(event_type, &e.items),
            SagaEvent::OrderConfirmed(_)
            | SagaEvent::OrderCancelled(_)
            | SagaEvent::PaymentFailed(_)
            | SagaEvent::StockReservationFailed(_) => Ok(()),
        }
    }
}

fn require_positive(event_type: &str, field: &str, amount: Money) -> Result<(), MalformedEvent> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(MalformedEvent::constraint(
            event_type,
            format!("{field} must be positive, got {amount}"),
        ))
    }
}

fn require_order_lines(event_type: &str, items: &[OrderLine]) -> Result<(), MalformedEvent> {
    if items.is_empty() {
        return Err(MalformedEvent::constraint(event_type, "items must not be empty"));
    }
    for line in items {
        if line.quantity == 0 {
            return Err(MalformedEvent::constraint(
                event_type,
                format!("quantity for {} must be at least 1", line.product_id),
            ));
        }
        require_positive(event_type, "price", line.price)?;
    }
    Ok(())
}

fn require_stock_items(event_type: &str, items: &[StockItem]) -> Result<(), MalformedEvent> {
    if items.is_empty() {
        return Err(MalformedEvent::constraint(event_type, "items must not be empty"));
    }
    match items.iter().find(|item| item.quantity == 0) {
        Some(item) => Err(MalformedEvent::constraint(
            event_type,
            format!("quantity for {} must be at least 1", item.product_id),
        )),
        None => Ok(()),
    }
}
