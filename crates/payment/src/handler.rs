//! Event handling for the payment participant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{Delivery, MessageHandler};
use contracts::{
    Decoded, EventEnvelope, OrderCreated, PaymentFailed, PaymentProcessed, PaymentRefunded,
    PaymentRequested, SagaEvent, StockItem, StockReservationFailed, decode,
};
use outbox::OutboxMessage;

use crate::gateway::{ChargeError, ChargeRequest, PaymentGateway};
use crate::{Payment, PaymentError, PaymentStatus, PaymentStore, Result, SOURCE};

/// Settings of the payment participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentConfig {
    /// Longest wait for the gateway before the payment is failed.
    pub charge_timeout: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            charge_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles `payment_events`.
pub struct PaymentHandler<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    config: PaymentConfig,
}

impl<S, G> PaymentHandler<S, G>
where
    S: PaymentStore + 'static,
    G: PaymentGateway + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, config: PaymentConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies one decoded event.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            event_id = %envelope.event_id,
            event_type = envelope.event_type(),
            order_id = %envelope.event.order_id()
        )
    )]
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<()> {
        match &envelope.event {
            SagaEvent::OrderCreated(event) => self.open_payment(event).await,
            SagaEvent::PaymentRequested(event) => self.charge(event).await,
            SagaEvent::StockReservationFailed(event) => self.compensate(event).await,
            _ => {
                tracing::debug!("event not handled by payment service");
                Ok(())
            }
        }
    }

    async fn open_payment(&self, event: &OrderCreated) -> Result<()> {
        if let Some(existing) = self.store.payment_for_order(&event.order_id).await? {
            tracing::debug!(payment_id = %existing.id, "payment already exists, skipping");
            return Ok(());
        }

        let payment = Payment::new(
            event.order_id.clone(),
            event.customer_id.clone(),
            event.total_amount,
        );
        let requested = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::PaymentRequested(PaymentRequested {
                order_id: payment.order_id.clone(),
                customer_id: payment.customer_id.clone(),
                payment_id: payment.id,
                amount: payment.amount,
                items: event.items.clone(),
            }),
        )?;

        if self.store.create_with_outbox(&payment, requested).await? {
            tracing::info!(payment_id = %payment.id, amount = %payment.amount, "payment opened");
        } else {
            tracing::debug!("payment created concurrently, skipping");
        }
        Ok(())
    }

    async fn charge(&self, event: &PaymentRequested) -> Result<()> {
        let payment = self
            .store
            .get_payment(event.payment_id)
            .await?
            .ok_or(PaymentError::NotFound(event.payment_id))?;
        if payment.status != PaymentStatus::Processing {
            tracing::debug!(status = %payment.status, "payment already settled, skipping");
            return Ok(());
        }

        let request = ChargeRequest {
            payment_id: payment.id,
            order_id: payment.order_id.clone(),
            customer_id: payment.customer_id.clone(),
            amount: payment.amount,
        };
        let outcome =
            tokio::time::timeout(self.config.charge_timeout, self.gateway.charge(&request)).await;

        match outcome {
            Ok(Ok(receipt)) => {
                let processed = OutboxMessage::for_event(
                    SOURCE,
                    SagaEvent::PaymentProcessed(PaymentProcessed {
                        order_id: payment.order_id.clone(),
                        payment_id: payment.id,
                        amount: payment.amount,
                        status: PaymentStatus::Completed.to_string(),
                        items: event.items.iter().map(StockItem::from).collect(),
                    }),
                )?;
                if self.settle(&payment, PaymentStatus::Completed, processed).await? {
                    metrics::counter!("saga_payments_completed_total").increment(1);
                    tracing::info!(
                        payment_id = %payment.id,
                        transaction_id = %receipt.transaction_id,
                        "payment completed"
                    );
                }
                Ok(())
            }
            Ok(Err(ChargeError::Declined(reason))) => {
                self.fail(&payment, reason.clone()).await?;
                Err(PaymentError::Declined {
                    payment_id: payment.id,
                    reason,
                })
            }
            Ok(Err(ChargeError::Unavailable(reason))) => {
                Err(PaymentError::GatewayUnavailable(reason))
            }
            Err(_elapsed) => {
                self.fail(&payment, "payment timed out".to_string()).await?;
                Err(PaymentError::TimedOut(payment.id))
            }
        }
    }

    async fn fail(&self, payment: &Payment, reason: String) -> Result<()> {
        let failed = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::PaymentFailed(PaymentFailed {
                order_id: payment.order_id.clone(),
                payment_id: payment.id,
                reason,
            }),
        )?;
        if self.settle(payment, PaymentStatus::Failed, failed).await? {
            metrics::counter!("saga_payments_failed_total").increment(1);
        }
        Ok(())
    }

    async fn settle(&self, payment: &Payment, to: PaymentStatus, outbox: OutboxMessage) -> Result<bool> {
        let moved = self
            .store
            .transition_with_outbox(payment.id, PaymentStatus::Processing, to, outbox)
            .await?;
        if !moved {
            tracing::debug!(payment_id = %payment.id, "payment settled concurrently");
        }
        Ok(moved)
    }

    /// Refunds a completed payment after stock could not be reserved.
    async fn compensate(&self, event: &StockReservationFailed) -> Result<()> {
        let Some(payment) = self.store.payment_for_order(&event.order_id).await? else {
            tracing::info!("no payment for order, nothing to refund");
            return Ok(());
        };
        if !payment.status.can_refund() {
            tracing::info!(status = %payment.status, "payment not refundable, skipping");
            return Ok(());
        }

        self.gateway
            .refund(payment.id, payment.amount)
            .await
            .map_err(|err| match err {
                ChargeError::Unavailable(reason) => PaymentError::GatewayUnavailable(reason),
                ChargeError::Declined(reason) => PaymentError::CorruptState(format!(
                    "refund of completed payment {} refused: {reason}",
                    payment.id
                )),
            })?;

        let refunded = OutboxMessage::for_event(
            SOURCE,
            SagaEvent::PaymentRefunded(PaymentRefunded {
                order_id: payment.order_id.clone(),
                payment_id: payment.id,
                amount: payment.amount,
                reason: event.reason.clone(),
            }),
        )?;
        let moved = self
            .store
            .transition_with_outbox(
                payment.id,
                PaymentStatus::Completed,
                PaymentStatus::Refunded,
                refunded,
            )
            .await?;
        if moved {
            metrics::counter!("saga_payments_refunded_total").increment(1);
            tracing::info!(payment_id = %payment.id, reason = %event.reason, "payment refunded");
        }
        Ok(())
    }
}

#[async_trait]
impl<S, G> MessageHandler for PaymentHandler<S, G>
where
    S: PaymentStore + 'static,
    G: PaymentGateway + 'static,
{
    type Error = PaymentError;

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        match decode(delivery.body())? {
            Decoded::Event(envelope) => self.handle_event(&envelope).await,
            Decoded::Unrecognized { event_type } => {
                tracing::debug!(%event_type, "ignoring unknown event type");
                Ok(())
            }
        }
    }
}
