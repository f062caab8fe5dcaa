//! Payment gateway trait and a simulated implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{CustomerId, Money, OrderId, PaymentId};
use thiserror::Error;

/// A charge to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Idempotency key: charging the same payment twice settles once.
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Money,
}

/// Proof of a settled charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_id: String,
}

/// Why a charge or refund did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChargeError {
    /// The provider refused. Final.
    #[error("declined: {0}")]
    Declined(String),

    /// The provider could not be reached. Worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges the customer. Repeating a request for the same payment id
    /// returns the original receipt.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ChargeError>;

    /// Gives a settled charge back. Repeating it is harmless.
    async fn refund(&self, payment_id: PaymentId, amount: Money) -> Result<(), ChargeError>;
}

#[derive(Debug, Default)]
struct GatewayState {
    charges: HashMap<PaymentId, ChargeReceipt>,
    refunds: HashSet<PaymentId>,
    declined_customers: HashSet<CustomerId>,
    decline_above: Option<Money>,
    unavailable_calls: u32,
    next_id: u32,
}

/// Simulated provider: waits a fixed latency, then approves.
///
/// Declines can be scripted per customer or by amount, and outages by number
/// of calls.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    latency: Duration,
    state: Arc<Mutex<GatewayState>>,
}

impl SimulatedGateway {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            state: Arc::default(),
        }
    }

    /// Every charge for `customer_id` is declined.
    pub fn decline_customer(&self, customer_id: CustomerId) {
        self.lock().declined_customers.insert(customer_id);
    }

    /// Charges above `limit` are declined.
    pub fn decline_above(&self, limit: Money) {
        self.lock().decline_above = Some(limit);
    }

    /// The next `calls` charges or refunds report the provider unavailable.
    pub fn fail_next_calls(&self, calls: u32) {
        self.lock().unavailable_calls = calls;
    }

    /// Distinct payments charged.
    pub fn charge_count(&self) -> usize {
        self.lock().charges.len()
    }

    pub fn was_refunded(&self, payment_id: PaymentId) -> bool {
        self.lock().refunds.contains(&payment_id)
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_outage(&self) -> Result<(), ChargeError> {
        let mut state = self.lock();
        if state.unavailable_calls > 0 {
            state.unavailable_calls -= 1;
            return Err(ChargeError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ChargeError> {
        self.take_outage()?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock();
        if let Some(receipt) = state.charges.get(&request.payment_id) {
            return Ok(receipt.clone());
        }
        if state.declined_customers.contains(&request.customer_id) {
            return Err(ChargeError::Declined("card declined".to_string()));
        }
        if state.decline_above.is_some_and(|limit| request.amount > limit) {
            return Err(ChargeError::Declined("amount exceeds limit".to_string()));
        }

        state.next_id += 1;
        let receipt = ChargeReceipt {
            transaction_id: format!("TXN-{:06}", state.next_id),
        };
        state.charges.insert(request.payment_id, receipt.clone());
        Ok(receipt)
    }

    async fn refund(&self, payment_id: PaymentId, _amount: Money) -> Result<(), ChargeError> {
        self.take_outage()?;
        let mut state = self.lock();
        if !state.charges.contains_key(&payment_id) {
            return Err(ChargeError::Declined(format!(
                "no charge for payment {payment_id}"
            )));
        }
        state.refunds.insert(payment_id);
        Ok(())
    }
}
