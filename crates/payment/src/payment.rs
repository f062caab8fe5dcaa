//! The payment entity and its state machine.

use chrono::{DateTime, Utc};
use common::{CustomerId, Money, OrderId, PaymentId};
use serde::{Deserialize, Serialize};

/// Status of a payment.
///
/// ```text
/// Processing ──┬──► Completed ──► Refunded
///              └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Created, charge not yet settled.
    Processing,

    /// Charged.
    Completed,

    /// Declined or timed out (terminal).
    Failed,

    /// Charged, then given back because stock could not be reserved (terminal).
    Refunded,
}

impl PaymentStatus {
    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Processing, PaymentStatus::Completed)
                | (PaymentStatus::Processing, PaymentStatus::Failed)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }

    /// Returns true if the payment can be refunded.
    pub fn can_refund(&self) -> bool {
        matches!(self, PaymentStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "Processing",
            PaymentStatus::Completed => "Completed",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
        }
    }

    /// Parses the stored form produced by [`PaymentStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Processing" => Some(PaymentStatus::Processing),
            "Completed" => Some(PaymentStatus::Completed),
            "Failed" => Some(PaymentStatus::Failed),
            "Refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payment for one order. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: PaymentId,
    /// At most one payment exists per order.
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// A new payment in `Processing`.
    pub fn new(order_id: OrderId, customer_id: CustomerId, amount: Money) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentId::new(),
            order_id,
            customer_id,
            amount,
            status: PaymentStatus::Processing,
            created_at: now,
            updated_at: now,
        }
    }
}
