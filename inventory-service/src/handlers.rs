use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bigdecimal::Zero;
use shared::events::BookingCreated;
use shared::store::ReserveOutcome;
use shared::{DomainEvent, InventoryStore, Job, JobHandler};
use tracing::{info, warn};

/// Handlers for jobs on the ticket queue.
#[derive(Clone)]
pub struct TicketSaga {
    inventory: Arc<dyn InventoryStore>,
}

impl TicketSaga {
    pub fn new(inventory: Arc<dyn InventoryStore>) -> Self {
        Self { inventory }
    }

    pub async fn dispatch(&self, event: DomainEvent) -> Result<()> {
        match event {
            DomainEvent::BookingCreated(e) => self.on_booking_created(e).await,
            other @ (DomainEvent::TicketsReserved(_)
            | DomainEvent::TicketsFailed(_)
            | DomainEvent::PaymentRequested(_)
            | DomainEvent::PaymentFailed(_)
            | DomainEvent::PaymentRefundRequested(_)
            | DomainEvent::PaymentRefundCompleted(_)
            | DomainEvent::BookingConfirmRequested(_)
            | DomainEvent::BookingPaymentFailed(_)
            | DomainEvent::BookingConfirmed(_)
            | DomainEvent::BookingCancelled(_)) => {
                bail!("ticket saga has no handler for {}", other.kind())
            }
        }
    }

    /// Holds the booking's tickets. Running out of stock is an outcome, not an
    /// error: it is recorded as `tickets.failed` and the booking is closed.
    async fn on_booking_created(&self, event: BookingCreated) -> Result<()> {
        let is_paid = !event.amount.is_zero();
        let outcome = self
            .inventory
            .reserve_for_booking(event.booking_id, event.ticket_type_id, event.quantity, is_paid)
            .await?;

        match outcome {
            ReserveOutcome::Reserved(tickets) => info!(
                booking_id = %event.booking_id,
                ticket_type_id = %tickets.id,
                quantity = event.quantity,
                available = tickets.available_quantity,
                "tickets reserved"
            ),
            ReserveOutcome::Rejected { reason } => warn!(
                booking_id = %event.booking_id,
                ticket_type_id = %event.ticket_type_id,
                %reason,
                "ticket reservation rejected"
            ),
            ReserveOutcome::AlreadyHandled(reservation) => info!(
                booking_id = %event.booking_id,
                status = %reservation.status,
                "reservation already recorded, skipping"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for TicketSaga {
    async fn handle(&self, job: &Job) -> Result<()> {
        let event = job.event()?;
        self.dispatch(event).await
    }
}
