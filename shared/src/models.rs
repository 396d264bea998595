use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::*;
use crate::store::{InventoryError, StoreError};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} `{}`",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Outbox rows only ever move forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Published,
}

string_enum!(OutboxStatus {
    Pending => "PENDING",
    Dispatched => "DISPATCHED",
    Published => "PUBLISHED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    /// A cancellation caused by the saga rather than the customer.
    Failed,
}

string_enum!(BookingStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
    Failed => "FAILED",
});

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Processing,
    Paid,
    NotRequired,
    Failed,
    RefundPending,
    Refunded,
}

string_enum!(PaymentStatus {
    Unpaid => "unpaid",
    Processing => "processing",
    Paid => "paid",
    NotRequired => "not_required",
    Failed => "failed",
    RefundPending => "refund_pending",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    PaymentFailed,
    InsufficientStock,
    Expired,
    Requested,
}

string_enum!(CancelReason {
    PaymentFailed => "payment_failed",
    InsufficientStock => "insufficient_stock",
    Expired => "expired",
    Requested => "requested",
});

impl CancelReason {
    /// Saga-driven cancellations end in FAILED, the rest in CANCELLED.
    pub fn terminal_status(self) -> BookingStatus {
        match self {
            CancelReason::PaymentFailed | CancelReason::InsufficientStock => BookingStatus::Failed,
            CancelReason::Expired | CancelReason::Requested => BookingStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Released,
    Committed,
    Rejected,
}

string_enum!(ReservationStatus {
    Reserved => "reserved",
    Released => "released",
    Committed => "committed",
    Rejected => "rejected",
});

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn kind(&self) -> Result<EventKind, EventError> {
        self.event_type.parse()
    }

    pub fn event(&self) -> Result<DomainEvent, EventError> {
        DomainEvent::parse(&self.event_type, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub event_type: EventKind,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn into_pending(self, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            aggregate_type: self.aggregate_type.as_str().to_string(),
            aggregate_id: self.aggregate_id,
            event_type: self.event_type.as_str().to_string(),
            payload: self.payload,
            status: OutboxStatus::Pending,
            created_at,
            dispatched_at: None,
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            status: event.status.as_str().to_string(),
            created_at: event.created_at,
            dispatched_at: event.dispatched_at,
            published_at: event.published_at,
        }
    }
}

impl TryFrom<DbOutboxEvent> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: DbOutboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            created_at: row.created_at,
            dispatched_at: row.dispatched_at,
            published_at: row.published_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::ticket_types)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub total_quantity: i32,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub sold_quantity: i32,
    pub price: BigDecimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicketType {
    pub event_id: Uuid,
    pub name: String,
    pub total_quantity: i32,
    pub price: BigDecimal,
    pub currency: String,
}

impl NewTicketType {
    pub fn into_ticket_type(self, now: DateTime<Utc>) -> TicketType {
        TicketType {
            id: Uuid::new_v4(),
            event_id: self.event_id,
            name: self.name,
            total_quantity: self.total_quantity,
            available_quantity: self.total_quantity,
            reserved_quantity: 0,
            sold_quantity: 0,
            price: self.price,
            currency: self.currency,
            created_at: now,
            updated_at: now,
        }
    }
}

impl TicketType {
    pub fn is_balanced(&self) -> bool {
        self.available_quantity >= 0
            && self.reserved_quantity >= 0
            && self.sold_quantity >= 0
            && self.available_quantity + self.reserved_quantity + self.sold_quantity
                == self.total_quantity
    }

    /// available -> reserved, only if enough is available.
    pub fn reserve(&mut self, quantity: i32) -> Result<(), InventoryError> {
        check_quantity(quantity)?;
        if self.available_quantity < quantity {
            return Err(InventoryError::InsufficientStock {
                ticket_type_id: self.id,
                requested: quantity,
                available: self.available_quantity,
            });
        }
        self.available_quantity -= quantity;
        self.reserved_quantity += quantity;
        Ok(())
    }

    /// reserved -> available.
    pub fn release(&mut self, quantity: i32) -> Result<(), InventoryError> {
        self.take_reserved(quantity)?;
        self.available_quantity += quantity;
        Ok(())
    }

    /// reserved -> sold.
    pub fn commit(&mut self, quantity: i32) -> Result<(), InventoryError> {
        self.take_reserved(quantity)?;
        self.sold_quantity += quantity;
        Ok(())
    }

    fn take_reserved(&mut self, quantity: i32) -> Result<(), InventoryError> {
        check_quantity(quantity)?;
        if self.reserved_quantity < quantity {
            return Err(InventoryError::InsufficientReserved {
                ticket_type_id: self.id,
                requested: quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.reserved_quantity -= quantity;
        Ok(())
    }
}

pub(crate) fn check_quantity(quantity: i32) -> Result<(), InventoryError> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidQuantity(quantity));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub booking_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub booking_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for DbReservation {
    fn from(reservation: &Reservation) -> Self {
        Self {
            booking_id: reservation.booking_id,
            ticket_type_id: reservation.ticket_type_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = StoreError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            booking_id: row.booking_id,
            ticket_type_id: row.ticket_type_id,
            quantity: row.quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    pub cancellation_reason: Option<CancelReason>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub user_id: Uuid,
    pub user_email: String,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

impl NewBooking {
    /// Builds the PENDING row together with the `booking.created` event that
    /// must be committed alongside it.
    pub fn into_booking(self, now: DateTime<Utc>) -> (Booking, DomainEvent) {
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            user_email: self.user_email,
            event_id: self.event_id,
            ticket_type_id: self.ticket_type_id,
            quantity: self.quantity,
            amount: self.amount,
            currency: self.currency,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            payment_intent_id: None,
            cancellation_reason: None,
            expires_at: self.expires_at,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        let event = DomainEvent::BookingCreated(BookingCreated {
            booking_id: booking.id,
            user_id: booking.user_id,
            user_email: booking.user_email.clone(),
            event_id: booking.event_id,
            ticket_type_id: booking.ticket_type_id,
            quantity: booking.quantity,
            amount: booking.amount.clone(),
            currency: booking.currency.clone(),
        });
        (booking, event)
    }
}

impl Booking {
    pub fn is_paid(&self) -> bool {
        !self.amount.is_zero()
    }

    /// Once tickets are held, ask for payment, or confirm straight away when
    /// nothing is owed. Returns `None` if payment was already requested or the
    /// booking is no longer pending.
    pub fn begin_payment(&mut self, now: DateTime<Utc>) -> Option<DomainEvent> {
        if self.status != BookingStatus::Pending || self.payment_status != PaymentStatus::Unpaid {
            return None;
        }
        self.updated_at = now;
        if !self.is_paid() {
            self.payment_status = PaymentStatus::NotRequired;
            return Some(DomainEvent::BookingConfirmRequested(BookingConfirmRequested {
                booking_id: self.id,
                payment_intent_id: None,
            }));
        }
        self.payment_status = PaymentStatus::Processing;
        Some(DomainEvent::PaymentRequested(PaymentRequested {
            booking_id: self.id,
            user_id: self.user_id,
            amount: self.amount.clone(),
            currency: self.currency.clone(),
        }))
    }

    /// PENDING -> CONFIRMED.
    pub fn confirm(
        &mut self,
        payment_intent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<DomainEvent> {
        if self.status != BookingStatus::Pending {
            return None;
        }
        self.status = BookingStatus::Confirmed;
        self.confirmed_at = Some(now);
        self.updated_at = now;
        if payment_intent_id.is_some() {
            self.payment_intent_id = payment_intent_id;
            self.payment_status = PaymentStatus::Paid;
        }
        Some(DomainEvent::BookingConfirmed(BookingConfirmed {
            booking_id: self.id,
            user_id: self.user_id,
            user_email: self.user_email.clone(),
            event_id: self.event_id,
            ticket_type_id: self.ticket_type_id,
            quantity: self.quantity,
            amount: self.amount.clone(),
            currency: self.currency.clone(),
            payment_intent_id: self.payment_intent_id.clone(),
            confirmed_at: now,
        }))
    }

    /// PENDING -> CANCELLED / FAILED.
    pub fn cancel(&mut self, reason: CancelReason, now: DateTime<Utc>) -> Option<DomainEvent> {
        if self.status != BookingStatus::Pending {
            return None;
        }
        self.status = reason.terminal_status();
        self.cancellation_reason = Some(reason);
        if reason == CancelReason::PaymentFailed {
            self.payment_status = PaymentStatus::Failed;
        }
        self.updated_at = now;
        Some(DomainEvent::BookingCancelled(BookingCancelled {
            booking_id: self.id,
            ticket_type_id: self.ticket_type_id,
            quantity: self.quantity,
            reason,
        }))
    }

    /// A payment that lands on a cancelled booking is handed back, once.
    pub fn request_refund(
        &mut self,
        payment_intent_id: String,
        now: DateTime<Utc>,
    ) -> Option<DomainEvent> {
        if !self.status.is_cancelled()
            || matches!(
                self.payment_status,
                PaymentStatus::RefundPending | PaymentStatus::Refunded
            )
        {
            return None;
        }
        self.payment_intent_id = Some(payment_intent_id.clone());
        self.payment_status = PaymentStatus::RefundPending;
        self.updated_at = now;
        Some(DomainEvent::PaymentRefundRequested(PaymentRefundRequested {
            booking_id: self.id,
            payment_intent_id,
        }))
    }

    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> bool {
        if self.payment_status != PaymentStatus::RefundPending {
            return false;
        }
        self.payment_status = PaymentStatus::Refunded;
        self.updated_at = now;
        true
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: String,
    pub payment_status: String,
    pub payment_intent_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Booking> for DbBooking {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            user_id: booking.user_id,
            user_email: booking.user_email.clone(),
            event_id: booking.event_id,
            ticket_type_id: booking.ticket_type_id,
            quantity: booking.quantity,
            amount: booking.amount.clone(),
            currency: booking.currency.clone(),
            status: booking.status.as_str().to_string(),
            payment_status: booking.payment_status.as_str().to_string(),
            payment_intent_id: booking.payment_intent_id.clone(),
            cancellation_reason: booking.cancellation_reason.map(|r| r.as_str().to_string()),
            expires_at: booking.expires_at,
            confirmed_at: booking.confirmed_at,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

impl TryFrom<DbBooking> for Booking {
    type Error = StoreError;

    fn try_from(row: DbBooking) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            user_email: row.user_email,
            event_id: row.event_id,
            ticket_type_id: row.ticket_type_id,
            quantity: row.quantity,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            payment_status: row.payment_status.parse()?,
            payment_intent_id: row.payment_intent_id,
            cancellation_reason: row
                .cancellation_reason
                .as_deref()
                .map(str::parse)
                .transpose()?,
            expires_at: row.expires_at,
            confirmed_at: row.confirmed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending_booking(amount: i64) -> Booking {
        let now = Utc::now();
        let (booking, _) = NewBooking {
            user_id: Uuid::new_v4(),
            user_email: "fan@example.com".to_string(),
            event_id: Uuid::new_v4(),
            ticket_type_id: Uuid::new_v4(),
            quantity: 2,
            amount: BigDecimal::from(amount),
            currency: "EUR".to_string(),
            expires_at: now + Duration::minutes(15),
        }
        .into_booking(now);
        booking
    }

    #[test]
    fn confirm_is_applied_once() {
        let mut booking = pending_booking(40);
        let now = Utc::now();

        let first = booking.confirm(Some("pi_1".to_string()), now);
        let confirmed_at = booking.confirmed_at;
        let second = booking.confirm(Some("pi_1".to_string()), now + Duration::seconds(5));

        assert!(matches!(first, Some(DomainEvent::BookingConfirmed(_))));
        assert!(second.is_none());
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.payment_status, PaymentStatus::Paid);
        assert_eq!(booking.confirmed_at, confirmed_at);
    }

    #[test]
    fn terminal_booking_is_never_revisited() {
        let mut booking = pending_booking(40);
        let now = Utc::now();
        assert!(booking.cancel(CancelReason::PaymentFailed, now).is_some());

        assert!(booking.confirm(Some("pi_late".to_string()), now).is_none());
        assert!(booking.cancel(CancelReason::Expired, now).is_none());
        assert_eq!(booking.status, BookingStatus::Failed);
        assert_eq!(booking.payment_status, PaymentStatus::Failed);
    }

    #[test]
    fn free_booking_skips_the_payment_step() {
        let mut booking = pending_booking(0);

        let next = booking.begin_payment(Utc::now());

        assert!(matches!(
            next,
            Some(DomainEvent::BookingConfirmRequested(BookingConfirmRequested {
                payment_intent_id: None,
                ..
            }))
        ));
        assert_eq!(booking.payment_status, PaymentStatus::NotRequired);
        assert!(booking.begin_payment(Utc::now()).is_none());
    }

    #[test]
    fn refund_is_requested_only_once_for_a_cancelled_booking() {
        let mut booking = pending_booking(40);
        let now = Utc::now();
        assert!(booking.request_refund("pi_1".to_string(), now).is_none());

        booking.cancel(CancelReason::Expired, now);

        assert!(booking.request_refund("pi_1".to_string(), now).is_some());
        assert!(booking.request_refund("pi_1".to_string(), now).is_none());
        assert!(booking.mark_refunded(now));
        assert!(!booking.mark_refunded(now));
        assert_eq!(booking.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn reserve_never_takes_more_than_available() {
        let mut tickets = NewTicketType {
            event_id: Uuid::new_v4(),
            name: "GA".to_string(),
            total_quantity: 10,
            price: BigDecimal::from(20),
            currency: "EUR".to_string(),
        }
        .into_ticket_type(Utc::now());

        tickets.reserve(7).unwrap();
        let err = tickets.reserve(5).unwrap_err();

        assert!(matches!(
            err,
            InventoryError::InsufficientStock { requested: 5, available: 3, .. }
        ));
        assert_eq!(tickets.available_quantity, 3);
        assert_eq!(tickets.reserved_quantity, 7);
        assert!(tickets.is_balanced());

        tickets.commit(4).unwrap();
        tickets.release(3).unwrap();
        assert!(tickets.release(1).is_err());
        assert_eq!(
            (tickets.available_quantity, tickets.reserved_quantity, tickets.sold_quantity),
            (6, 0, 4)
        );
        assert!(tickets.is_balanced());
    }
}
