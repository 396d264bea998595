use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use num_traits::ToPrimitive;
use shared::events::*;
use shared::models::NewOutboxEvent;
use shared::{permanent, DomainEvent, Job, JobHandler, OutboxStore};
use tracing::{info, warn};

use crate::gateway::{GatewayError, PaymentGateway};

/// Handlers for jobs on the payment queue. Gateway calls are bounded by
/// `timeout`; a timeout counts as a failed attempt and the job is retried.
#[derive(Clone)]
pub struct PaymentSaga {
    gateway: Arc<dyn PaymentGateway>,
    outbox: Arc<dyn OutboxStore>,
    timeout: Duration,
}

impl PaymentSaga {
    pub fn new(gateway: Arc<dyn PaymentGateway>, outbox: Arc<dyn OutboxStore>, timeout: Duration) -> Self {
        Self {
            gateway,
            outbox,
            timeout,
        }
    }

    pub async fn dispatch(&self, event: DomainEvent) -> Result<()> {
        match event {
            DomainEvent::PaymentRequested(e) => self.on_payment_requested(e).await,
            DomainEvent::PaymentRefundRequested(e) => self.on_refund_requested(e).await,
            other @ (DomainEvent::BookingCreated(_)
            | DomainEvent::TicketsReserved(_)
            | DomainEvent::TicketsFailed(_)
            | DomainEvent::PaymentFailed(_)
            | DomainEvent::PaymentRefundCompleted(_)
            | DomainEvent::BookingConfirmRequested(_)
            | DomainEvent::BookingPaymentFailed(_)
            | DomainEvent::BookingConfirmed(_)
            | DomainEvent::BookingCancelled(_)) => {
                bail!("payment saga has no handler for {}", other.kind())
            }
        }
    }

    async fn on_payment_requested(&self, event: PaymentRequested) -> Result<()> {
        let amount = minor_units(&event.amount)?;
        let metadata = HashMap::from([
            ("booking_id".to_string(), event.booking_id.to_string()),
            ("user_id".to_string(), event.user_id.to_string()),
        ]);
        let key = format!("payment-{}", event.booking_id);
        let charge = self
            .call(
                self.gateway
                    .create_payment_intent(amount, &event.currency, metadata, &key),
            )
            .await;

        let next = match charge {
            Ok(intent) => {
                info!(booking_id = %event.booking_id, payment_intent_id = %intent.id, "payment captured");
                DomainEvent::BookingConfirmRequested(BookingConfirmRequested {
                    booking_id: event.booking_id,
                    payment_intent_id: Some(intent.id),
                })
            }
            Err(e) if !e.is_transient() => {
                warn!(booking_id = %event.booking_id, "payment rejected: {}", e);
                DomainEvent::BookingPaymentFailed(PaymentFailed {
                    booking_id: event.booking_id,
                    reason: e.to_string(),
                    payment_intent_id: None,
                })
            }
            Err(e) => return Err(e).context("payment gateway call failed"),
        };
        self.emit(next).await
    }

    async fn on_refund_requested(&self, event: PaymentRefundRequested) -> Result<()> {
        let key = format!("refund-{}", event.booking_id);
        let receipt = match self.call(self.gateway.refund(&event.payment_intent_id, &key)).await {
            Ok(receipt) => receipt,
            Err(e) if !e.is_transient() => {
                warn!(booking_id = %event.booking_id, payment_intent_id = %event.payment_intent_id, "refund rejected: {}", e);
                return Err(permanent(e)).context("refund failed");
            }
            Err(e) => return Err(e).context("refund failed"),
        };
        info!(booking_id = %event.booking_id, refund_id = %receipt.id, "payment refunded");

        self.emit(DomainEvent::PaymentRefundCompleted(PaymentRefundCompleted {
            booking_id: event.booking_id,
            payment_intent_id: event.payment_intent_id,
            refund_id: receipt.id,
        }))
        .await
    }

    async fn call<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.timeout)))
    }

    async fn emit(&self, event: DomainEvent) -> Result<()> {
        self.outbox.append(NewOutboxEvent::try_from(event)?).await?;
        Ok(())
    }
}

fn minor_units(amount: &BigDecimal) -> Result<i64> {
    (amount * BigDecimal::from(100))
        .round(0)
        .to_i64()
        .with_context(|| format!("amount {} is out of range", amount))
}

#[async_trait]
impl JobHandler for PaymentSaga {
    async fn handle(&self, job: &Job) -> Result<()> {
        let event = job.event()?;
        self.dispatch(event).await
    }
}
