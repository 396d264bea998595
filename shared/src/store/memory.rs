use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::*;
use crate::models::*;
use crate::events::*;

#[derive(Default)]
struct Tables {
    outbox: Vec<OutboxEvent>,
    bookings: HashMap<Uuid, Booking>,
    ticket_types: HashMap<Uuid, TicketType>,
    reservations: HashMap<Uuid, Reservation>,
}

impl Tables {
    fn ticket_type(&self, id: Uuid) -> Result<&TicketType, InventoryError> {
        self.ticket_types.get(&id).ok_or(InventoryError::NotFound(id))
    }

    /// Computes the reservation/stock rows a booking transition would write,
    /// without writing them.
    fn plan_effect(
        &self,
        booking_id: Uuid,
        effect: ReservationEffect,
        now: DateTime<Utc>,
    ) -> Result<Option<(Reservation, TicketType)>, StoreError> {
        let Some(reservation) = self.reservations.get(&booking_id) else {
            return Ok(None);
        };
        if effect == ReservationEffect::None || reservation.status != ReservationStatus::Reserved {
            return Ok(None);
        }

        let mut tickets = self
            .ticket_type(reservation.ticket_type_id)
            .map_err(InventoryError::into_invariant)?
            .clone();
        let mut reservation = reservation.clone();
        match effect {
            ReservationEffect::Commit => {
                tickets.commit(reservation.quantity).map_err(InventoryError::into_invariant)?;
                reservation.status = ReservationStatus::Committed;
            }
            ReservationEffect::Release => {
                tickets.release(reservation.quantity).map_err(InventoryError::into_invariant)?;
                reservation.status = ReservationStatus::Released;
            }
            ReservationEffect::None => return Ok(None),
        }
        tickets.updated_at = now;
        reservation.updated_at = now;
        Ok(Some((reservation, tickets)))
    }

    fn write_effect(&mut self, planned: Option<(Reservation, TicketType)>) {
        if let Some((reservation, tickets)) = planned {
            self.ticket_types.insert(tickets.id, tickets);
            self.reservations.insert(reservation.booking_id, reservation);
        }
    }

    fn push_events(&mut self, rows: Vec<NewOutboxEvent>, now: DateTime<Utc>) {
        self.outbox.extend(rows.into_iter().map(|row| row.into_pending(now)));
    }
}

fn encode_all(events: Vec<DomainEvent>) -> Result<Vec<NewOutboxEvent>, StoreError> {
    events
        .into_iter()
        .map(|event| NewOutboxEvent::try_from(event).map_err(StoreError::from))
        .collect()
}

/// Single-process store. One lock over every table makes each saga step
/// atomic, mirroring the transaction boundaries of [`super::PgStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn outbox(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.clone()
    }

    /// Decoded events of one kind, in append order.
    pub async fn events_of(&self, kind: EventKind) -> Vec<DomainEvent> {
        self.tables
            .lock()
            .await
            .outbox
            .iter()
            .filter(|row| row.event_type == kind.as_str())
            .filter_map(|row| row.event().ok())
            .collect()
    }

    /// Appends a row bypassing the event catalogue, as a stale deploy would.
    pub async fn append_raw(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.tables.lock().await.outbox.push(OutboxEvent {
            id,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            event_type: event_type.to_string(),
            payload,
            status: OutboxStatus::Pending,
            created_at: now,
            dispatched_at: None,
            published_at: None,
        });
        id
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        effect: ReservationEffect,
        step: F,
    ) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut Booking, DateTime<Utc>) -> Option<Vec<DomainEvent>> + Send,
    {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut booking = tables
            .bookings
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "booking", id })?;

        let Some(events) = step(&mut booking, now) else {
            return Ok(Transition::Skipped(booking));
        };
        let rows = encode_all(events)?;
        let planned = tables.plan_effect(id, effect, now)?;

        tables.write_effect(planned);
        tables.bookings.insert(id, booking.clone());
        tables.push_events(rows, now);
        Ok(Transition::Applied(booking))
    }

    async fn adjust<F>(&self, ticket_type_id: Uuid, change: F) -> Result<TicketType, InventoryError>
    where
        F: FnOnce(&mut TicketType) -> Result<(), InventoryError> + Send,
    {
        let mut tables = self.tables.lock().await;
        let mut tickets = tables.ticket_type(ticket_type_id)?.clone();
        change(&mut tickets)?;
        tickets.updated_at = Utc::now();
        tables.ticket_types.insert(ticket_type_id, tickets.clone());
        Ok(tickets)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<Uuid, StoreError> {
        let id = event.id;
        self.tables.lock().await.push_events(vec![event], Utc::now());
        Ok(id)
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<OutboxEvent> = tables
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|row| row.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.outbox.iter_mut().find(|row| row.id == id) {
            Some(row) if row.status == OutboxStatus::Pending => {
                row.status = OutboxStatus::Dispatched;
                row.dispatched_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_published(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.outbox.iter_mut().find(|row| row.id == id) {
            Some(row) if row.status == OutboxStatus::Dispatched => {
                row.status = OutboxStatus::Published;
                row.published_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unpublished(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<OutboxEvent> = tables
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Dispatched)
            .filter(|row| row.kind().is_ok())
            .filter(|row| row.dispatched_at.is_some_and(|at| at < dispatched_before))
            .cloned()
            .collect();
        stale.sort_by_key(|row| row.dispatched_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.outbox.iter().find(|row| row.id == id).cloned())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn create_ticket_type(&self, ticket_type: NewTicketType) -> Result<TicketType, StoreError> {
        let tickets = ticket_type.into_ticket_type(Utc::now());
        self.tables
            .lock()
            .await
            .ticket_types
            .insert(tickets.id, tickets.clone());
        Ok(tickets)
    }

    async fn find_ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError> {
        Ok(self.tables.lock().await.ticket_types.get(&id).cloned())
    }

    async fn reserve(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        self.adjust(ticket_type_id, |t| t.reserve(quantity)).await
    }

    async fn release(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        self.adjust(ticket_type_id, |t| t.release(quantity)).await
    }

    async fn commit(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        self.adjust(ticket_type_id, |t| t.commit(quantity)).await
    }

    async fn reserve_for_booking(
        &self,
        booking_id: Uuid,
        ticket_type_id: Uuid,
        quantity: i32,
        is_paid: bool,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.reservations.get(&booking_id) {
            return Ok(ReserveOutcome::AlreadyHandled(existing.clone()));
        }

        let now = Utc::now();
        let attempt = tables.ticket_type(ticket_type_id).cloned().and_then(|mut tickets| {
            tickets.reserve(quantity)?;
            tickets.updated_at = now;
            Ok(tickets)
        });

        let (status, event, outcome) = match attempt {
            Ok(tickets) => (
                ReservationStatus::Reserved,
                DomainEvent::TicketsReserved(TicketsReserved {
                    booking_id,
                    ticket_type_id,
                    quantity,
                    is_paid,
                }),
                ReserveOutcome::Reserved(tickets),
            ),
            Err(e) => {
                let reason = e.into_rejection()?;
                (
                    ReservationStatus::Rejected,
                    DomainEvent::TicketsFailed(TicketsFailed {
                        booking_id,
                        ticket_type_id,
                        quantity,
                        reason: reason.clone(),
                    }),
                    ReserveOutcome::Rejected { reason },
                )
            }
        };
        let row = NewOutboxEvent::try_from(event)?;

        if let ReserveOutcome::Reserved(tickets) = &outcome {
            tables.ticket_types.insert(ticket_type_id, tickets.clone());
        }
        tables.reservations.insert(
            booking_id,
            Reservation {
                booking_id,
                ticket_type_id,
                quantity,
                status,
                created_at: now,
                updated_at: now,
            },
        );
        tables.push_events(vec![row], now);
        Ok(outcome)
    }

    async fn release_for_booking(&self, booking_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let planned = tables.plan_effect(booking_id, ReservationEffect::Release, Utc::now())?;
        let released = planned.is_some();
        tables.write_effect(planned);
        Ok(released)
    }

    async fn find_reservation(&self, booking_id: Uuid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.tables.lock().await.reservations.get(&booking_id).cloned())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn create_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let now = Utc::now();
        let (booking, event) = booking.into_booking(now);
        let row = NewOutboxEvent::try_from(event)?;

        let mut tables = self.tables.lock().await;
        tables.bookings.insert(booking.id, booking.clone());
        tables.push_events(vec![row], now);
        Ok(booking)
    }

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables.lock().await.bookings.get(&id).cloned())
    }

    async fn begin_payment(&self, id: Uuid) -> Result<Transition, StoreError> {
        self.transition(id, ReservationEffect::None, |booking, now| {
            booking.begin_payment(now).map(|event| vec![event])
        })
        .await
    }

    async fn confirm_booking(
        &self,
        id: Uuid,
        payment_intent_id: Option<String>,
    ) -> Result<Transition, StoreError> {
        self.transition(id, ReservationEffect::Commit, move |booking, now| {
            booking.confirm(payment_intent_id, now).map(|event| vec![event])
        })
        .await
    }

    async fn cancel_booking(&self, id: Uuid, reason: CancelReason) -> Result<Transition, StoreError> {
        self.transition(id, ReservationEffect::Release, move |booking, now| {
            booking.cancel(reason, now).map(|event| vec![event])
        })
        .await
    }

    async fn request_refund(
        &self,
        id: Uuid,
        payment_intent_id: String,
    ) -> Result<Transition, StoreError> {
        self.transition(id, ReservationEffect::None, move |booking, now| {
            booking
                .request_refund(payment_intent_id, now)
                .map(|event| vec![event])
        })
        .await
    }

    async fn mark_refunded(&self, id: Uuid) -> Result<Transition, StoreError> {
        self.transition(id, ReservationEffect::None, |booking, now| {
            booking.mark_refunded(now).then(Vec::new)
        })
        .await
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>, StoreError> {
        let tables = self.tables.lock().await;
        let mut expired: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by_key(|b| b.expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::Duration;
    use proptest::prelude::*;

    async fn seed_tickets(store: &MemoryStore, total: i32) -> TicketType {
        store
            .create_ticket_type(NewTicketType {
                event_id: Uuid::new_v4(),
                name: "General admission".to_string(),
                total_quantity: total,
                price: BigDecimal::from(25),
                currency: "EUR".to_string(),
            })
            .await
            .unwrap()
    }

    async fn seed_booking(store: &MemoryStore, tickets: &TicketType, quantity: i32) -> Booking {
        store
            .create_booking(NewBooking {
                user_id: Uuid::new_v4(),
                user_email: "fan@example.com".to_string(),
                event_id: tickets.event_id,
                ticket_type_id: tickets.id,
                quantity,
                amount: BigDecimal::from(25 * quantity),
                currency: "EUR".to_string(),
                expires_at: Utc::now() + Duration::minutes(15),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 10).await;
        let ticket_type_id = tickets.id;

        let attempts: Vec<_> = (0..25)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve(ticket_type_id, 1).await })
            })
            .collect();

        let mut succeeded = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(InventoryError::InsufficientStock { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
        assert_eq!(succeeded, 10);
        assert_eq!(after.available_quantity, 0);
        assert_eq!(after.reserved_quantity, 10);
        assert!(after.is_balanced());
    }

    #[tokio::test]
    async fn competing_bookings_cannot_both_reserve() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 10).await;
        let a = seed_booking(&store, &tickets, 7).await;
        let b = seed_booking(&store, &tickets, 5).await;

        let (first, second) = tokio::join!(
            store.reserve_for_booking(a.id, tickets.id, 7, true),
            store.reserve_for_booking(b.id, tickets.id, 5, true),
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        let reserved = outcomes
            .iter()
            .filter(|o| matches!(o, ReserveOutcome::Reserved(_)))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, ReserveOutcome::Rejected { .. }))
            .count();
        assert_eq!((reserved, rejected), (1, 1));

        let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
        assert!(matches!(
            (after.available_quantity, after.reserved_quantity),
            (3, 7) | (5, 5)
        ));
        assert!(after.is_balanced());
        assert_eq!(store.events_of(EventKind::TicketsReserved).await.len(), 1);
        assert_eq!(store.events_of(EventKind::TicketsFailed).await.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_reservation_is_a_no_op() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 10).await;
        let booking = seed_booking(&store, &tickets, 3).await;

        store.reserve_for_booking(booking.id, tickets.id, 3, true).await.unwrap();
        let again = store.reserve_for_booking(booking.id, tickets.id, 3, true).await.unwrap();

        assert!(matches!(
            again,
            ReserveOutcome::AlreadyHandled(Reservation { status: ReservationStatus::Reserved, .. })
        ));
        let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
        assert_eq!(after.available_quantity, 7);
        assert_eq!(store.events_of(EventKind::TicketsReserved).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_ticket_type_is_a_rejection() {
        let store = MemoryStore::new();
        let booking_id = Uuid::new_v4();

        let outcome = store
            .reserve_for_booking(booking_id, Uuid::new_v4(), 1, false)
            .await
            .unwrap();

        assert!(matches!(outcome, ReserveOutcome::Rejected { .. }));
        let reservation = store.find_reservation(booking_id).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Rejected);
    }

    #[tokio::test]
    async fn outbox_status_only_moves_forward() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 5).await;
        seed_booking(&store, &tickets, 1).await;
        let id = store.list_pending(10).await.unwrap()[0].id;

        assert!(!store.mark_published(id).await.unwrap());
        assert!(store.mark_dispatched(id).await.unwrap());
        assert!(!store.mark_dispatched(id).await.unwrap());
        assert!(store.list_pending(10).await.unwrap().is_empty());
        assert!(store.mark_published(id).await.unwrap());
        assert!(!store.mark_published(id).await.unwrap());

        let row = store.find_event(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.dispatched_at.is_some() && row.published_at.is_some());
    }

    #[tokio::test]
    async fn stale_dispatched_rows_are_listed_for_reconciliation() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 5).await;
        seed_booking(&store, &tickets, 1).await;
        let id = store.list_pending(10).await.unwrap()[0].id;
        store.mark_dispatched(id).await.unwrap();

        let cutoff_before = Utc::now() - Duration::minutes(1);
        let cutoff_after = Utc::now() + Duration::seconds(1);

        assert!(store.list_unpublished(cutoff_before, 10).await.unwrap().is_empty());
        assert_eq!(store.list_unpublished(cutoff_after, 10).await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn cancelling_after_reservation_restores_stock() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 10).await;
        let booking = seed_booking(&store, &tickets, 4).await;
        store.reserve_for_booking(booking.id, tickets.id, 4, true).await.unwrap();

        let transition = store
            .cancel_booking(booking.id, CancelReason::PaymentFailed)
            .await
            .unwrap();

        assert!(transition.is_applied());
        assert_eq!(transition.booking().status, BookingStatus::Failed);
        let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
        assert_eq!(after.available_quantity, 10);
        assert_eq!(after.reserved_quantity, 0);
        let reservation = store.find_reservation(booking.id).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Released);
        assert!(!store.release_for_booking(booking.id).await.unwrap());
        assert_eq!(store.events_of(EventKind::BookingCancelled).await.len(), 1);
    }

    #[tokio::test]
    async fn confirming_twice_commits_and_emits_once() {
        let store = MemoryStore::new();
        let tickets = seed_tickets(&store, 10).await;
        let booking = seed_booking(&store, &tickets, 2).await;
        store.reserve_for_booking(booking.id, tickets.id, 2, true).await.unwrap();

        let first = store
            .confirm_booking(booking.id, Some("pi_123".to_string()))
            .await
            .unwrap();
        let second = store
            .confirm_booking(booking.id, Some("pi_123".to_string()))
            .await
            .unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(second.booking().confirmed_at, first.booking().confirmed_at);
        let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
        assert_eq!((after.reserved_quantity, after.sold_quantity), (0, 2));
        assert_eq!(store.events_of(EventKind::BookingConfirmed).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_booking_is_reported() {
        let store = MemoryStore::new();
        let err = store.begin_payment(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "booking", .. }));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(i32),
        Release(i32),
        Commit(i32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1..6i32).prop_map(Op::Reserve),
            (1..6i32).prop_map(Op::Release),
            (1..6i32).prop_map(Op::Commit),
        ]
    }

    proptest! {
        #[test]
        fn stock_counters_stay_balanced(total in 0..30i32, ops in proptest::collection::vec(op(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = MemoryStore::new();
                let tickets = seed_tickets(&store, total).await;
                for op in ops {
                    let before = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
                    let result = match op {
                        Op::Reserve(q) => store.reserve(tickets.id, q).await,
                        Op::Release(q) => store.release(tickets.id, q).await,
                        Op::Commit(q) => store.commit(tickets.id, q).await,
                    };
                    let after = store.find_ticket_type(tickets.id).await.unwrap().unwrap();
                    prop_assert!(after.is_balanced());
                    if result.is_err() {
                        prop_assert_eq!(
                            (before.available_quantity, before.reserved_quantity, before.sold_quantity),
                            (after.available_quantity, after.reserved_quantity, after.sold_quantity)
                        );
                    }
                }
                Ok(())
            })?;
        }
    }
}
