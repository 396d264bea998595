use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::events::*;
use shared::models::{Booking, CancelReason};
use shared::store::Transition;
use shared::{metrics, BookingStore, DomainEvent, InventoryStore, Job, JobHandler};
use tracing::{info, warn};
use uuid::Uuid;

/// Handlers for jobs on the booking queue.
///
/// Every transition is a guarded store call, so a redelivered job finds the
/// booking already moved on and is skipped.
#[derive(Clone)]
pub struct BookingSaga {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
}

impl BookingSaga {
    pub fn new(bookings: Arc<dyn BookingStore>, inventory: Arc<dyn InventoryStore>) -> Self {
        Self {
            bookings,
            inventory,
        }
    }

    pub async fn dispatch(&self, event: DomainEvent) -> Result<()> {
        match event {
            DomainEvent::TicketsReserved(e) => self.on_tickets_reserved(e).await,
            DomainEvent::TicketsFailed(e) => self.on_tickets_failed(e).await,
            DomainEvent::BookingConfirmRequested(e) => self.on_confirm_requested(e).await,
            DomainEvent::BookingPaymentFailed(e) | DomainEvent::PaymentFailed(e) => {
                self.on_payment_failed(e).await
            }
            DomainEvent::PaymentRefundCompleted(e) => self.on_refund_completed(e).await,
            other @ (DomainEvent::BookingCreated(_)
            | DomainEvent::PaymentRequested(_)
            | DomainEvent::PaymentRefundRequested(_)
            | DomainEvent::BookingConfirmed(_)
            | DomainEvent::BookingCancelled(_)) => {
                bail!("booking saga has no handler for {}", other.kind())
            }
        }
    }

    async fn on_tickets_reserved(&self, event: TicketsReserved) -> Result<()> {
        match self.bookings.begin_payment(event.booking_id).await? {
            Transition::Applied(booking) => {
                info!(booking_id = %booking.id, paid = booking.is_paid(), "tickets held, payment started");
            }
            Transition::Skipped(booking) if booking.status.is_terminal() => {
                // The booking was closed before the hold landed.
                let released = self.inventory.release_for_booking(booking.id).await?;
                warn!(
                    booking_id = %booking.id,
                    status = %booking.status,
                    released,
                    "tickets reserved for a closed booking"
                );
            }
            Transition::Skipped(booking) => {
                info!(booking_id = %booking.id, "payment already requested, skipping");
            }
        }
        Ok(())
    }

    async fn on_tickets_failed(&self, event: TicketsFailed) -> Result<()> {
        info!(booking_id = %event.booking_id, reason = %event.reason, "ticket reservation rejected");
        self.cancel(event.booking_id, CancelReason::InsufficientStock).await
    }

    async fn on_confirm_requested(&self, event: BookingConfirmRequested) -> Result<()> {
        let intent = event.payment_intent_id.clone();
        match self.bookings.confirm_booking(event.booking_id, intent).await? {
            Transition::Applied(booking) => {
                metrics::record_booking_confirmed();
                info!(booking_id = %booking.id, "booking confirmed");
            }
            Transition::Skipped(booking) => self.refund_if_orphaned(booking, event.payment_intent_id).await?,
        }
        Ok(())
    }

    /// A payment that succeeded after the booking was closed must be handed back.
    async fn refund_if_orphaned(&self, booking: Booking, payment_intent_id: Option<String>) -> Result<()> {
        match payment_intent_id {
            Some(intent) if booking.status.is_cancelled() => {
                let transition = self.bookings.request_refund(booking.id, intent).await?;
                if transition.is_applied() {
                    warn!(booking_id = %booking.id, status = %booking.status, "payment captured for closed booking, refund requested");
                }
            }
            _ => info!(booking_id = %booking.id, status = %booking.status, "booking already settled, skipping confirm"),
        }
        Ok(())
    }

    async fn on_payment_failed(&self, event: PaymentFailed) -> Result<()> {
        info!(booking_id = %event.booking_id, reason = %event.reason, "payment failed");
        self.cancel(event.booking_id, CancelReason::PaymentFailed).await
    }

    async fn on_refund_completed(&self, event: PaymentRefundCompleted) -> Result<()> {
        let transition = self.bookings.mark_refunded(event.booking_id).await?;
        if transition.is_applied() {
            info!(booking_id = %event.booking_id, refund_id = %event.refund_id, "refund completed");
        }
        Ok(())
    }

    async fn cancel(&self, booking_id: Uuid, reason: CancelReason) -> Result<()> {
        match self.bookings.cancel_booking(booking_id, reason).await? {
            Transition::Applied(booking) => {
                metrics::record_booking_failed(reason);
                info!(booking_id = %booking.id, status = %booking.status, %reason, "booking closed");
            }
            Transition::Skipped(booking) => {
                info!(booking_id = %booking.id, status = %booking.status, "booking already settled, skipping cancel");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for BookingSaga {
    async fn handle(&self, job: &Job) -> Result<()> {
        let event = job.event()?;
        self.dispatch(event).await
    }
}
