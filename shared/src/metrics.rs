//! Counters exported on `/metrics`.
//!
//! ## Counters
//! - `bookings_created_total`
//! - `bookings_confirmed_total`
//! - `bookings_failed_total{reason}` - bookings that ended CANCELLED or FAILED
//! - `bookings_expired_total`
//! - `outbox_dispatched_total{queue}`
//! - `outbox_publish_failures_total`
//! - `outbox_republished_total`
//! - `notifications_sent_total`
//! - `notifications_retried_total`
//! - `notifications_dead_lettered_total`
//! - `saga_jobs_dead_lettered_total{queue}`

use metrics::describe_counter;

use crate::models::CancelReason;
use crate::queue::Queue;

/// Registers descriptions. Call once at startup, after installing a recorder.
pub fn register() {
    describe_counter!("bookings_created_total", "Bookings accepted in PENDING state");
    describe_counter!("bookings_confirmed_total", "Bookings that reached CONFIRMED");
    describe_counter!(
        "bookings_failed_total",
        "Bookings that ended CANCELLED or FAILED, by reason"
    );
    describe_counter!(
        "bookings_expired_total",
        "PENDING bookings cancelled by the reaper"
    );

    describe_counter!(
        "outbox_dispatched_total",
        "Outbox events marked DISPATCHED, by destination queue"
    );
    describe_counter!(
        "outbox_publish_failures_total",
        "Queue publishes that failed after the DISPATCHED mark"
    );
    describe_counter!(
        "outbox_republished_total",
        "DISPATCHED events re-published by the reconciliation sweep"
    );

    describe_counter!("notifications_sent_total", "Confirmation emails delivered");
    describe_counter!(
        "notifications_retried_total",
        "Confirmation emails re-queued after a failed delivery"
    );
    describe_counter!(
        "notifications_dead_lettered_total",
        "Confirmation emails that exhausted their retries"
    );
    describe_counter!(
        "saga_jobs_dead_lettered_total",
        "Saga jobs that exhausted their retries, by queue"
    );

    tracing::info!("metrics registered");
}

pub fn record_booking_created() {
    metrics::counter!("bookings_created_total").increment(1);
}

pub fn record_booking_confirmed() {
    metrics::counter!("bookings_confirmed_total").increment(1);
}

pub fn record_booking_failed(reason: CancelReason) {
    metrics::counter!("bookings_failed_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_booking_expired() {
    metrics::counter!("bookings_expired_total").increment(1);
}

pub fn record_outbox_dispatched(queue: Option<Queue>) {
    let queue = queue.map_or("terminal", Queue::as_str);
    metrics::counter!("outbox_dispatched_total", "queue" => queue).increment(1);
}

pub fn record_outbox_publish_failure() {
    metrics::counter!("outbox_publish_failures_total").increment(1);
}

pub fn record_outbox_republished() {
    metrics::counter!("outbox_republished_total").increment(1);
}

pub fn record_notification_sent() {
    metrics::counter!("notifications_sent_total").increment(1);
}

/// Requeues and dead letters are counted per queue family.
pub fn record_requeued(queue: Queue) {
    if queue == Queue::Email {
        metrics::counter!("notifications_retried_total").increment(1);
    }
}

pub fn record_dead_lettered(queue: Queue) {
    match queue {
        Queue::Email => metrics::counter!("notifications_dead_lettered_total").increment(1),
        other => {
            metrics::counter!("saga_jobs_dead_lettered_total", "queue" => other.as_str())
                .increment(1)
        }
    }
}
