use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use booking_service::{BookingSaga, DispatcherConfig, OutboxDispatcher};
use chrono::Utc;
use inventory_service::TicketSaga;
use notification_service::{BookingConfirmedMailer, MailError, MailMessage, MailSender};
use payment_service::{PaymentSaga, SimulatedGateway};
use shared::models::*;
use shared::queue::MemoryQueue;
use shared::store::MemoryStore;
use shared::{BookingStore, EventKind, InventoryStore, JobPublisher, Queue, RetryPolicy, Worker};
use uuid::Uuid;

struct Inbox {
    failing: AtomicBool,
    attempts: AtomicU32,
    delivered: AtomicU32,
}

#[async_trait]
impl MailSender for Inbox {
    async fn send(&self, _message: &MailMessage) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError::Unavailable("smtp down".to_string()));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
    queue: MemoryQueue,
    inbox: Arc<Inbox>,
    dispatcher: OutboxDispatcher,
    ticket: Worker<TicketSaga>,
    booking: Worker<BookingSaga>,
    payment: Worker<PaymentSaga>,
    email: Worker<BookingConfirmedMailer>,
}

impl Harness {
    fn new(payment_success_rate: f64, mail_failing: bool) -> Self {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let publisher: Arc<dyn JobPublisher> = Arc::new(queue.clone());
        let inbox = Arc::new(Inbox {
            failing: AtomicBool::new(mail_failing),
            attempts: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        });
        let shared_store = Arc::new(store.clone());

        Self {
            dispatcher: OutboxDispatcher::new(
                shared_store.clone(),
                publisher.clone(),
                DispatcherConfig::default(),
            ),
            ticket: Worker::new(
                Queue::Ticket,
                TicketSaga::new(shared_store.clone()),
                publisher.clone(),
                RetryPolicy::default(),
            ),
            booking: Worker::new(
                Queue::Booking,
                BookingSaga::new(shared_store.clone(), shared_store.clone()),
                publisher.clone(),
                RetryPolicy::default(),
            ),
            payment: Worker::new(
                Queue::Payment,
                PaymentSaga::new(
                    Arc::new(SimulatedGateway::new(payment_success_rate)),
                    shared_store,
                    Duration::from_secs(5),
                ),
                publisher.clone(),
                RetryPolicy::default(),
            ),
            email: Worker::new(
                Queue::Email,
                BookingConfirmedMailer::new(inbox.clone(), Duration::from_secs(5)),
                publisher,
                RetryPolicy::notifications(),
            ),
            store,
            queue,
            inbox,
        }
    }

    async fn ticket_type(&self, total: i32, price: i64) -> TicketType {
        self.store
            .create_ticket_type(NewTicketType {
                event_id: Uuid::new_v4(),
                name: "General Admission".to_string(),
                total_quantity: total,
                price: BigDecimal::from(price),
                currency: "USD".to_string(),
            })
            .await
            .unwrap()
    }

    async fn book(&self, tickets: &TicketType, quantity: i32) -> Booking {
        self.store
            .create_booking(NewBooking {
                user_id: Uuid::new_v4(),
                user_email: "fan@example.com".to_string(),
                event_id: tickets.event_id,
                ticket_type_id: tickets.id,
                quantity,
                amount: &tickets.price * BigDecimal::from(quantity),
                currency: tickets.currency.clone(),
                expires_at: Utc::now() + chrono::Duration::minutes(15),
            })
            .await
            .unwrap()
    }

    /// Alternates dispatcher ticks and worker drains until nothing moves.
    async fn settle(&self) {
        for _ in 0..50 {
            self.dispatcher.tick().await.unwrap();
            let mut worked = false;
            for job in self.queue.drain(Queue::Ticket) {
                self.ticket.process(job).await.unwrap();
                worked = true;
            }
            for job in self.queue.drain(Queue::Payment) {
                self.payment.process(job).await.unwrap();
                worked = true;
            }
            for job in self.queue.drain(Queue::Booking) {
                self.booking.process(job).await.unwrap();
                worked = true;
            }
            for job in self.queue.drain(Queue::Email) {
                self.email.process(job).await.unwrap();
                worked = true;
            }
            if !worked {
                return;
            }
        }
        panic!("saga did not settle");
    }

    async fn booking(&self, id: Uuid) -> Booking {
        self.store.find_booking(id).await.unwrap().unwrap()
    }

    async fn stock(&self, id: Uuid) -> TicketType {
        self.store.find_ticket_type(id).await.unwrap().unwrap()
    }

    async fn assert_outbox_drained(&self) {
        for row in self.store.outbox().await {
            assert_eq!(row.status, OutboxStatus::Published, "{} left behind", row.event_type);
        }
    }
}

#[tokio::test]
async fn paid_booking_is_confirmed_sold_and_emailed() {
    let h = Harness::new(1.0, false);
    let tickets = h.ticket_type(10, 25).await;
    let booking = h.book(&tickets, 2).await;

    h.settle().await;

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, PaymentStatus::Paid);
    assert!(booking.payment_intent_id.is_some());
    assert!(booking.confirmed_at.is_some());

    let stock = h.stock(tickets.id).await;
    assert_eq!(
        (stock.available_quantity, stock.reserved_quantity, stock.sold_quantity),
        (8, 0, 2)
    );
    assert_eq!(h.inbox.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.events_of(EventKind::BookingConfirmed).await.len(), 1);
    h.assert_outbox_drained().await;
}

#[tokio::test]
async fn declined_payment_fails_the_booking_and_restores_stock() {
    let h = Harness::new(0.0, false);
    let tickets = h.ticket_type(10, 25).await;
    let booking = h.book(&tickets, 4).await;

    h.settle().await;

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Failed);
    assert_eq!(booking.cancellation_reason, Some(CancelReason::PaymentFailed));
    let stock = h.stock(tickets.id).await;
    assert_eq!(stock.available_quantity, 10);
    assert!(stock.is_balanced());
    assert_eq!(h.inbox.attempts.load(Ordering::SeqCst), 0);
    h.assert_outbox_drained().await;
}

#[tokio::test]
async fn free_booking_confirms_without_payment() {
    let h = Harness::new(0.0, false);
    let tickets = h.ticket_type(3, 0).await;
    let booking = h.book(&tickets, 1).await;

    h.settle().await;

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, PaymentStatus::NotRequired);
    assert!(h.store.events_of(EventKind::PaymentRequested).await.is_empty());
}

#[tokio::test]
async fn competing_bookings_never_oversell() {
    let h = Harness::new(1.0, false);
    let tickets = h.ticket_type(10, 10).await;
    let a = h.book(&tickets, 7).await;
    let b = h.book(&tickets, 5).await;

    h.settle().await;

    let a = h.booking(a.id).await;
    let b = h.booking(b.id).await;
    let statuses = [a.status, b.status];
    assert!(statuses.contains(&BookingStatus::Confirmed));
    assert!(statuses.contains(&BookingStatus::Failed));
    let loser = if a.status == BookingStatus::Failed { &a } else { &b };
    assert_eq!(loser.cancellation_reason, Some(CancelReason::InsufficientStock));

    let winner = if a.status == BookingStatus::Confirmed { &a } else { &b };
    let stock = h.stock(tickets.id).await;
    assert_eq!(stock.sold_quantity, winner.quantity);
    assert_eq!(stock.available_quantity, 10 - winner.quantity);
    assert!(stock.is_balanced());
}

#[tokio::test]
async fn undeliverable_email_is_dead_lettered_without_touching_the_booking() {
    let h = Harness::new(1.0, true);
    let tickets = h.ticket_type(5, 40).await;
    let booking = h.book(&tickets, 1).await;

    h.settle().await;

    assert_eq!(h.booking(booking.id).await.status, BookingStatus::Confirmed);
    assert_eq!(h.inbox.attempts.load(Ordering::SeqCst), 4);
    let dead = h.queue.drain(Queue::EmailDeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload["totalAttempts"], 4);
    assert_eq!(dead[0].payload["booking_id"], booking.id.to_string());
}

#[tokio::test]
async fn lost_publish_is_recovered_and_the_saga_completes() {
    let h = Harness::new(1.0, false);
    let tickets = h.ticket_type(10, 25).await;
    let booking = h.book(&tickets, 1).await;
    h.queue.fail_next(1);

    h.settle().await;
    assert_eq!(h.booking(booking.id).await.status, BookingStatus::Pending);

    let report = h
        .dispatcher
        .reconcile(Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.published, 1);
    h.settle().await;

    assert_eq!(h.booking(booking.id).await.status, BookingStatus::Confirmed);
    h.assert_outbox_drained().await;
}

#[tokio::test]
async fn expired_booking_is_reaped_and_late_payment_refunded() {
    let h = Harness::new(1.0, false);
    let tickets = h.ticket_type(10, 25).await;
    let booking = h.book(&tickets, 3).await;

    // Hold tickets and capture payment, but stop before the booking worker confirms.
    h.dispatcher.tick().await.unwrap();
    for job in h.queue.drain(Queue::Ticket) {
        h.ticket.process(job).await.unwrap();
    }
    h.dispatcher.tick().await.unwrap();
    for job in h.queue.drain(Queue::Booking) {
        h.booking.process(job).await.unwrap();
    }
    h.dispatcher.tick().await.unwrap();
    for job in h.queue.drain(Queue::Payment) {
        h.payment.process(job).await.unwrap();
    }

    let reaper = booking_service::BookingReaper::new(Arc::new(h.store.clone()), 10);
    assert_eq!(reaper.sweep(Utc::now() + chrono::Duration::hours(1)).await.unwrap(), 1);

    h.settle().await;

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.payment_status, PaymentStatus::Refunded);
    assert_eq!(h.stock(tickets.id).await.available_quantity, 10);
    assert_eq!(h.inbox.attempts.load(Ordering::SeqCst), 0);
}
