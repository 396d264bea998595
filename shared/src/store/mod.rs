//! Persistence seams for the saga.
//!
//! Each saga step that touches more than one row is a single trait method so
//! both backends can make it atomic: the Postgres store wraps it in one
//! transaction, the in-memory store holds one lock for its duration.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel_async::pooled_connection::PoolError;
use thiserror::Error;
use uuid::Uuid;

use crate::events::EventError;
use crate::models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("inventory invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(
        "insufficient stock for ticket type {ticket_type_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        ticket_type_id: Uuid,
        requested: i32,
        available: i32,
    },
    #[error(
        "insufficient reserved stock for ticket type {ticket_type_id}: requested {requested}, reserved {reserved}"
    )]
    InsufficientReserved {
        ticket_type_id: Uuid,
        requested: i32,
        reserved: i32,
    },
    #[error("ticket type {0} not found")]
    NotFound(Uuid),
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<diesel::result::Error> for InventoryError {
    fn from(e: diesel::result::Error) -> Self {
        InventoryError::Store(StoreError::Database(e))
    }
}

impl InventoryError {
    /// Business rejections become a failed reservation; store failures stay errors.
    pub(crate) fn into_rejection(self) -> Result<String, StoreError> {
        match self {
            InventoryError::Store(e) => Err(e),
            rejection => Ok(rejection.to_string()),
        }
    }

    /// Compensations run against stock we reserved ourselves, so a shortfall
    /// means the counters are out of balance.
    pub(crate) fn into_invariant(self) -> StoreError {
        match self {
            InventoryError::Store(e) => e,
            other => StoreError::Invariant(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved(TicketType),
    Rejected { reason: String },
    /// The booking already has a reservation row; nothing was changed.
    AlreadyHandled(Reservation),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Booking),
    Skipped(Booking),
}

impl Transition {
    pub fn booking(&self) -> &Booking {
        match self {
            Transition::Applied(b) | Transition::Skipped(b) => b,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// What a booking transition does to the booking's reservation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReservationEffect {
    None,
    Commit,
    Release,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, event: NewOutboxEvent) -> Result<Uuid, StoreError>;

    /// Oldest first.
    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError>;

    /// PENDING -> DISPATCHED. Returns `false` without touching the row if it
    /// was not PENDING.
    async fn mark_dispatched(&self, id: Uuid) -> Result<bool, StoreError>;

    /// DISPATCHED -> PUBLISHED, guarded the same way.
    async fn mark_published(&self, id: Uuid) -> Result<bool, StoreError>;

    /// DISPATCHED rows of a known event type whose publish was never
    /// confirmed. Rows parked because their type is unknown are left out.
    async fn list_unpublished(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn find_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn create_ticket_type(&self, ticket_type: NewTicketType) -> Result<TicketType, StoreError>;

    async fn find_ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError>;

    /// available -> reserved, conditional on `available_quantity >= quantity`.
    async fn reserve(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError>;

    /// reserved -> available, conditional on `reserved_quantity >= quantity`.
    async fn release(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError>;

    /// reserved -> sold, conditional on `reserved_quantity >= quantity`.
    async fn commit(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError>;

    /// Reserves stock for a booking and records the outcome with its
    /// `tickets.reserved` / `tickets.failed` event. At most once per booking.
    async fn reserve_for_booking(
        &self,
        booking_id: Uuid,
        ticket_type_id: Uuid,
        quantity: i32,
        is_paid: bool,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Gives back a booking's held stock. Returns `false` if nothing was held.
    async fn release_for_booking(&self, booking_id: Uuid) -> Result<bool, StoreError>;

    async fn find_reservation(&self, booking_id: Uuid) -> Result<Option<Reservation>, StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Commits the PENDING booking and its `booking.created` event together.
    async fn create_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn begin_payment(&self, id: Uuid) -> Result<Transition, StoreError>;

    /// PENDING -> CONFIRMED, commits the reservation, emits `booking.confirmed`.
    async fn confirm_booking(
        &self,
        id: Uuid,
        payment_intent_id: Option<String>,
    ) -> Result<Transition, StoreError>;

    /// PENDING -> CANCELLED/FAILED, releases the reservation, emits `booking.cancelled`.
    async fn cancel_booking(&self, id: Uuid, reason: CancelReason) -> Result<Transition, StoreError>;

    async fn request_refund(
        &self,
        id: Uuid,
        payment_intent_id: String,
    ) -> Result<Transition, StoreError>;

    async fn mark_refunded(&self, id: Uuid) -> Result<Transition, StoreError>;

    /// PENDING bookings whose `expires_at` is before `now`.
    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>, StoreError>;
}
