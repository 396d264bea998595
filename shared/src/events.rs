//! The closed catalogue of saga events.
//!
//! Every event that can be written to the outbox is a variant of [`EventKind`]
//! and carries one of the payload structs below. Handlers match on
//! [`DomainEvent`] so adding an event forces every dispatch table to be
//! revisited at compile time.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CancelReason, NewOutboxEvent};
use crate::queue::{Queue, Route};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("unknown aggregate type `{0}`")]
    UnknownAggregateType(String),
    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    Booking,
    Ticket,
    Payment,
}

impl AggregateType {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateType::Booking => "Booking",
            AggregateType::Ticket => "Ticket",
            AggregateType::Payment => "Payment",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Booking" => Ok(AggregateType::Booking),
            "Ticket" => Ok(AggregateType::Ticket),
            "Payment" => Ok(AggregateType::Payment),
            other => Err(EventError::UnknownAggregateType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BookingCreated,
    TicketsReserved,
    TicketsFailed,
    PaymentRequested,
    PaymentFailed,
    PaymentRefundRequested,
    PaymentRefundCompleted,
    BookingConfirmRequested,
    BookingPaymentFailed,
    BookingConfirmed,
    BookingCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::BookingCreated,
        EventKind::TicketsReserved,
        EventKind::TicketsFailed,
        EventKind::PaymentRequested,
        EventKind::PaymentFailed,
        EventKind::PaymentRefundRequested,
        EventKind::PaymentRefundCompleted,
        EventKind::BookingConfirmRequested,
        EventKind::BookingPaymentFailed,
        EventKind::BookingConfirmed,
        EventKind::BookingCancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BookingCreated => "booking.created",
            EventKind::TicketsReserved => "tickets.reserved",
            EventKind::TicketsFailed => "tickets.failed",
            EventKind::PaymentRequested => "payment.requested",
            EventKind::PaymentFailed => "payment.failed",
            EventKind::PaymentRefundRequested => "payment.refund.requested",
            EventKind::PaymentRefundCompleted => "payment.refund.completed",
            EventKind::BookingConfirmRequested => "booking.confirm.requested",
            EventKind::BookingPaymentFailed => "booking.payment.failed",
            EventKind::BookingConfirmed => "booking.confirmed",
            EventKind::BookingCancelled => "booking.cancelled",
        }
    }

    pub fn aggregate_type(self) -> AggregateType {
        match self {
            EventKind::BookingCreated
            | EventKind::BookingConfirmRequested
            | EventKind::BookingPaymentFailed
            | EventKind::BookingConfirmed
            | EventKind::BookingCancelled => AggregateType::Booking,
            EventKind::TicketsReserved | EventKind::TicketsFailed => AggregateType::Ticket,
            EventKind::PaymentRequested
            | EventKind::PaymentFailed
            | EventKind::PaymentRefundRequested
            | EventKind::PaymentRefundCompleted => AggregateType::Payment,
        }
    }

    /// Static event -> queue table used by the outbox dispatcher.
    pub fn route(self) -> Route {
        match self {
            EventKind::BookingCreated => Route::Queue(Queue::Ticket),
            EventKind::PaymentRequested | EventKind::PaymentRefundRequested => {
                Route::Queue(Queue::Payment)
            }
            EventKind::TicketsReserved
            | EventKind::TicketsFailed
            | EventKind::PaymentFailed
            | EventKind::PaymentRefundCompleted
            | EventKind::BookingConfirmRequested
            | EventKind::BookingPaymentFailed => Route::Queue(Queue::Booking),
            EventKind::BookingConfirmed => Route::Queue(Queue::Email),
            EventKind::BookingCancelled => Route::Terminal,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCreated {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketsReserved {
    pub booking_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub is_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketsFailed {
    pub booking_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
}

/// Shared by `payment.failed` and `booking.payment.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub booking_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefundRequested {
    pub booking_id: Uuid,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefundCompleted {
    pub booking_id: Uuid,
    pub payment_intent_id: String,
    pub refund_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmRequested {
    pub booking_id: Uuid,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_intent_id: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCancelled {
    pub booking_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub reason: CancelReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    BookingCreated(BookingCreated),
    TicketsReserved(TicketsReserved),
    TicketsFailed(TicketsFailed),
    PaymentRequested(PaymentRequested),
    PaymentFailed(PaymentFailed),
    PaymentRefundRequested(PaymentRefundRequested),
    PaymentRefundCompleted(PaymentRefundCompleted),
    BookingConfirmRequested(BookingConfirmRequested),
    BookingPaymentFailed(PaymentFailed),
    BookingConfirmed(BookingConfirmed),
    BookingCancelled(BookingCancelled),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::BookingCreated(_) => EventKind::BookingCreated,
            DomainEvent::TicketsReserved(_) => EventKind::TicketsReserved,
            DomainEvent::TicketsFailed(_) => EventKind::TicketsFailed,
            DomainEvent::PaymentRequested(_) => EventKind::PaymentRequested,
            DomainEvent::PaymentFailed(_) => EventKind::PaymentFailed,
            DomainEvent::PaymentRefundRequested(_) => EventKind::PaymentRefundRequested,
            DomainEvent::PaymentRefundCompleted(_) => EventKind::PaymentRefundCompleted,
            DomainEvent::BookingConfirmRequested(_) => EventKind::BookingConfirmRequested,
            DomainEvent::BookingPaymentFailed(_) => EventKind::BookingPaymentFailed,
            DomainEvent::BookingConfirmed(_) => EventKind::BookingConfirmed,
            DomainEvent::BookingCancelled(_) => EventKind::BookingCancelled,
        }
    }

    /// Ticket events belong to the ticket type; everything else to the booking.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            DomainEvent::TicketsReserved(e) => e.ticket_type_id,
            DomainEvent::TicketsFailed(e) => e.ticket_type_id,
            DomainEvent::BookingCreated(e) => e.booking_id,
            DomainEvent::PaymentRequested(e) => e.booking_id,
            DomainEvent::PaymentFailed(e) | DomainEvent::BookingPaymentFailed(e) => e.booking_id,
            DomainEvent::PaymentRefundRequested(e) => e.booking_id,
            DomainEvent::PaymentRefundCompleted(e) => e.booking_id,
            DomainEvent::BookingConfirmRequested(e) => e.booking_id,
            DomainEvent::BookingConfirmed(e) => e.booking_id,
            DomainEvent::BookingCancelled(e) => e.booking_id,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, EventError> {
        let encoded = match self {
            DomainEvent::BookingCreated(e) => serde_json::to_value(e),
            DomainEvent::TicketsReserved(e) => serde_json::to_value(e),
            DomainEvent::TicketsFailed(e) => serde_json::to_value(e),
            DomainEvent::PaymentRequested(e) => serde_json::to_value(e),
            DomainEvent::PaymentFailed(e) | DomainEvent::BookingPaymentFailed(e) => {
                serde_json::to_value(e)
            }
            DomainEvent::PaymentRefundRequested(e) => serde_json::to_value(e),
            DomainEvent::PaymentRefundCompleted(e) => serde_json::to_value(e),
            DomainEvent::BookingConfirmRequested(e) => serde_json::to_value(e),
            DomainEvent::BookingConfirmed(e) => serde_json::to_value(e),
            DomainEvent::BookingCancelled(e) => serde_json::to_value(e),
        };
        encoded.map_err(|source| EventError::Encode {
            kind: self.kind(),
            source,
        })
    }

    pub fn decode(kind: EventKind, payload: &serde_json::Value) -> Result<Self, EventError> {
        fn body<T: serde::de::DeserializeOwned>(
            kind: EventKind,
            payload: &serde_json::Value,
        ) -> Result<T, EventError> {
            T::deserialize(payload).map_err(|source| EventError::InvalidPayload { kind, source })
        }

        Ok(match kind {
            EventKind::BookingCreated => DomainEvent::BookingCreated(body(kind, payload)?),
            EventKind::TicketsReserved => DomainEvent::TicketsReserved(body(kind, payload)?),
            EventKind::TicketsFailed => DomainEvent::TicketsFailed(body(kind, payload)?),
            EventKind::PaymentRequested => DomainEvent::PaymentRequested(body(kind, payload)?),
            EventKind::PaymentFailed => DomainEvent::PaymentFailed(body(kind, payload)?),
            EventKind::PaymentRefundRequested => {
                DomainEvent::PaymentRefundRequested(body(kind, payload)?)
            }
            EventKind::PaymentRefundCompleted => {
                DomainEvent::PaymentRefundCompleted(body(kind, payload)?)
            }
            EventKind::BookingConfirmRequested => {
                DomainEvent::BookingConfirmRequested(body(kind, payload)?)
            }
            EventKind::BookingPaymentFailed => {
                DomainEvent::BookingPaymentFailed(body(kind, payload)?)
            }
            EventKind::BookingConfirmed => DomainEvent::BookingConfirmed(body(kind, payload)?),
            EventKind::BookingCancelled => DomainEvent::BookingCancelled(body(kind, payload)?),
        })
    }

    pub fn parse(event_type: &str, payload: &serde_json::Value) -> Result<Self, EventError> {
        Self::decode(event_type.parse()?, payload)
    }
}

impl TryFrom<DomainEvent> for NewOutboxEvent {
    type Error = EventError;

    fn try_from(event: DomainEvent) -> Result<Self, Self::Error> {
        let kind = event.kind();
        Ok(NewOutboxEvent {
            id: Uuid::new_v4(),
            aggregate_type: kind.aggregate_type(),
            aggregate_id: event.aggregate_id(),
            event_type: kind,
            payload: event.payload()?,
        })
    }
}
