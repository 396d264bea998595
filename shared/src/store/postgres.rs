use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::warn;
use uuid::Uuid;

use super::*;
use crate::models::*;
use crate::events::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        effect: ReservationEffect,
        step: F,
    ) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut Booking, DateTime<Utc>) -> Option<Vec<DomainEvent>> + Send + 'static,
    {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let row = bookings::table
                    .find(id)
                    .for_update()
                    .first::<DbBooking>(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound { entity: "booking", id })?;
                let mut booking = Booking::try_from(row)?;
                let now = Utc::now();

                let Some(events) = step(&mut booking, now) else {
                    return Ok(Transition::Skipped(booking));
                };

                diesel::update(bookings::table.find(id))
                    .set(&DbBooking::from(&booking))
                    .execute(conn)
                    .await?;
                apply_reservation_effect(conn, id, effect, now).await?;
                for event in events {
                    insert_event(conn, NewOutboxEvent::try_from(event)?, now).await?;
                }

                Ok(Transition::Applied(booking))
            })
        })
        .await
    }
}

async fn insert_event(
    conn: &mut AsyncPgConnection,
    event: NewOutboxEvent,
    now: DateTime<Utc>,
) -> Result<Uuid, StoreError> {
    let row = DbOutboxEvent::from(event.into_pending(now));
    let id = row.id;
    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(id)
}

async fn load_ticket_type(
    conn: &mut AsyncPgConnection,
    id: Uuid,
) -> Result<TicketType, InventoryError> {
    ticket_types::table
        .find(id)
        .first::<TicketType>(conn)
        .await
        .optional()?
        .ok_or(InventoryError::NotFound(id))
}

/// The oversell guard: a single conditional UPDATE. If the precondition does
/// not hold no row is touched and the current counters explain why.
async fn reserve_stock(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    quantity: i32,
) -> Result<TicketType, InventoryError> {
    check_quantity(quantity)?;
    let updated = diesel::update(
        ticket_types::table
            .find(id)
            .filter(ticket_types::available_quantity.ge(quantity)),
    )
    .set((
        ticket_types::available_quantity.eq(ticket_types::available_quantity - quantity),
        ticket_types::reserved_quantity.eq(ticket_types::reserved_quantity + quantity),
        ticket_types::updated_at.eq(Utc::now()),
    ))
    .get_result::<TicketType>(conn)
    .await
    .optional()?;

    match updated {
        Some(tickets) => Ok(tickets),
        None => {
            let current = load_ticket_type(conn, id).await?;
            Err(InventoryError::InsufficientStock {
                ticket_type_id: id,
                requested: quantity,
                available: current.available_quantity,
            })
        }
    }
}

async fn release_stock(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    quantity: i32,
) -> Result<TicketType, InventoryError> {
    check_quantity(quantity)?;
    let updated = diesel::update(
        ticket_types::table
            .find(id)
            .filter(ticket_types::reserved_quantity.ge(quantity)),
    )
    .set((
        ticket_types::available_quantity.eq(ticket_types::available_quantity + quantity),
        ticket_types::reserved_quantity.eq(ticket_types::reserved_quantity - quantity),
        ticket_types::updated_at.eq(Utc::now()),
    ))
    .get_result::<TicketType>(conn)
    .await
    .optional()?;

    match updated {
        Some(tickets) => Ok(tickets),
        None => Err(insufficient_reserved(conn, id, quantity).await),
    }
}

async fn commit_stock(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    quantity: i32,
) -> Result<TicketType, InventoryError> {
    check_quantity(quantity)?;
    let updated = diesel::update(
        ticket_types::table
            .find(id)
            .filter(ticket_types::reserved_quantity.ge(quantity)),
    )
    .set((
        ticket_types::reserved_quantity.eq(ticket_types::reserved_quantity - quantity),
        ticket_types::sold_quantity.eq(ticket_types::sold_quantity + quantity),
        ticket_types::updated_at.eq(Utc::now()),
    ))
    .get_result::<TicketType>(conn)
    .await
    .optional()?;

    match updated {
        Some(tickets) => Ok(tickets),
        None => Err(insufficient_reserved(conn, id, quantity).await),
    }
}

async fn insufficient_reserved(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    quantity: i32,
) -> InventoryError {
    match load_ticket_type(conn, id).await {
        Ok(current) => InventoryError::InsufficientReserved {
            ticket_type_id: id,
            requested: quantity,
            reserved: current.reserved_quantity,
        },
        Err(e) => e,
    }
}

/// Moves the booking's reservation row out of `reserved` and adjusts stock
/// to match. Rows in any other state are left alone.
async fn apply_reservation_effect(
    conn: &mut AsyncPgConnection,
    booking_id: Uuid,
    effect: ReservationEffect,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let next = match effect {
        ReservationEffect::None => return Ok(false),
        ReservationEffect::Commit => ReservationStatus::Committed,
        ReservationEffect::Release => ReservationStatus::Released,
    };

    let claimed = diesel::update(
        reservations::table
            .find(booking_id)
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str())),
    )
    .set((
        reservations::status.eq(next.as_str()),
        reservations::updated_at.eq(now),
    ))
    .get_result::<DbReservation>(conn)
    .await
    .optional()?;

    let Some(reservation) = claimed else {
        if effect == ReservationEffect::Commit {
            warn!(%booking_id, "Confirming booking without a held reservation");
        }
        return Ok(false);
    };

    let adjusted = match effect {
        ReservationEffect::Commit => {
            commit_stock(conn, reservation.ticket_type_id, reservation.quantity).await
        }
        _ => release_stock(conn, reservation.ticket_type_id, reservation.quantity).await,
    };
    adjusted.map_err(InventoryError::into_invariant)?;
    Ok(true)
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<Uuid, StoreError> {
        let mut conn = self.pool.get().await?;
        insert_event(&mut conn, event, Utc::now()).await
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Pending.as_str()))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            outbox_events::table
                .find(id)
                .filter(outbox_events::status.eq(OutboxStatus::Pending.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Dispatched.as_str()),
            outbox_events::dispatched_at.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }

    async fn mark_published(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            outbox_events::table
                .find(id)
                .filter(outbox_events::status.eq(OutboxStatus::Dispatched.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Published.as_str()),
            outbox_events::published_at.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }

    async fn list_unpublished(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Dispatched.as_str()))
            .filter(outbox_events::event_type.eq_any(EventKind::ALL.map(EventKind::as_str)))
            .filter(outbox_events::dispatched_at.lt(dispatched_before))
            .order(outbox_events::dispatched_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError> {
        let mut conn = self.pool.get().await?;

        outbox_events::table
            .find(id)
            .first::<DbOutboxEvent>(&mut conn)
            .await
            .optional()?
            .map(OutboxEvent::try_from)
            .transpose()
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn create_ticket_type(&self, ticket_type: NewTicketType) -> Result<TicketType, StoreError> {
        let mut conn = self.pool.get().await?;
        let tickets = ticket_type.into_ticket_type(Utc::now());

        diesel::insert_into(ticket_types::table)
            .values(&tickets)
            .execute(&mut conn)
            .await?;

        Ok(tickets)
    }

    async fn find_ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError> {
        let mut conn = self.pool.get().await?;

        let tickets = ticket_types::table
            .find(id)
            .first::<TicketType>(&mut conn)
            .await
            .optional()?;

        Ok(tickets)
    }

    async fn reserve(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;
        reserve_stock(&mut conn, ticket_type_id, quantity).await
    }

    async fn release(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;
        release_stock(&mut conn, ticket_type_id, quantity).await
    }

    async fn commit(&self, ticket_type_id: Uuid, quantity: i32) -> Result<TicketType, InventoryError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;
        commit_stock(&mut conn, ticket_type_id, quantity).await
    }

    async fn reserve_for_booking(
        &self,
        booking_id: Uuid,
        ticket_type_id: Uuid,
        quantity: i32,
        is_paid: bool,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();
                let claimed = diesel::insert_into(reservations::table)
                    .values(&DbReservation {
                        booking_id,
                        ticket_type_id,
                        quantity,
                        status: ReservationStatus::Reserved.as_str().to_string(),
                        created_at: now,
                        updated_at: now,
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;

                if claimed == 0 {
                    let existing = reservations::table
                        .find(booking_id)
                        .first::<DbReservation>(conn)
                        .await?;
                    return Ok(ReserveOutcome::AlreadyHandled(Reservation::try_from(existing)?));
                }

                let (event, outcome) = match reserve_stock(conn, ticket_type_id, quantity).await {
                    Ok(tickets) => (
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
                        diesel::update(reservations::table.find(booking_id))
                            .set(reservations::status.eq(ReservationStatus::Rejected.as_str()))
                            .execute(conn)
                            .await?;
                        (
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

                insert_event(conn, NewOutboxEvent::try_from(event)?, now).await?;
                Ok(outcome)
            })
        })
        .await
    }

    async fn release_for_booking(&self, booking_id: Uuid) -> Result<bool, StoreError> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                apply_reservation_effect(conn, booking_id, ReservationEffect::Release, Utc::now())
                    .await
            })
        })
        .await
    }

    async fn find_reservation(&self, booking_id: Uuid) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.pool.get().await?;

        reservations::table
            .find(booking_id)
            .first::<DbReservation>(&mut conn)
            .await
            .optional()?
            .map(Reservation::try_from)
            .transpose()
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn create_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let now = Utc::now();
        let (booking, event) = booking.into_booking(now);
        let row = DbBooking::from(&booking);
        let event = NewOutboxEvent::try_from(event)?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(bookings::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                insert_event(conn, event, now).await?;
                Ok(())
            })
        })
        .await?;

        Ok(booking)
    }

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.pool.get().await?;

        bookings::table
            .find(id)
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
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
        let mut conn = self.pool.get().await?;

        let rows = bookings::table
            .filter(bookings::status.eq(BookingStatus::Pending.as_str()))
            .filter(bookings::expires_at.lt(now))
            .order(bookings::expires_at.asc())
            .limit(limit)
            .load::<DbBooking>(&mut conn)
            .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }
}
