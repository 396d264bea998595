use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use shared::events::BookingConfirmed;
use shared::queue::DeadLetter;
use shared::{permanent, DomainEvent, Job, JobHandler};
use tracing::{error, info};

use crate::mailer::{MailError, MailMessage, MailSender};

/// Sends the confirmation email for `booking.confirmed`. A failed send is
/// returned as an error so the worker's retry policy decides what happens next.
#[derive(Clone)]
pub struct BookingConfirmedMailer {
    sender: Arc<dyn MailSender>,
    timeout: Duration,
}

impl BookingConfirmedMailer {
    pub fn new(sender: Arc<dyn MailSender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    async fn deliver(&self, booking: BookingConfirmed) -> Result<()> {
        let message = render(&booking);
        let sent = tokio::time::timeout(self.timeout, self.sender.send(&message))
            .await
            .with_context(|| format!("mail sender timed out after {:?}", self.timeout))?;
        match sent {
            Ok(()) => {}
            // The provider will refuse this message on every attempt.
            Err(e @ MailError::Rejected(_)) => return Err(permanent(e)).context("mail delivery failed"),
            Err(e) => return Err(e).context("mail delivery failed"),
        }

        shared::metrics::record_notification_sent();
        info!(booking_id = %booking.booking_id, to = %message.to, "confirmation email delivered");
        Ok(())
    }
}

fn render(booking: &BookingConfirmed) -> MailMessage {
    MailMessage {
        to: booking.user_email.clone(),
        subject: "Your booking is confirmed".to_string(),
        html: format!(
            "<h1>Booking confirmed</h1>\
             <p>Booking <strong>{}</strong> for {} ticket(s) is confirmed.</p>\
             <p>Total paid: {} {}</p>\
             <p>Confirmed at {}</p>",
            booking.booking_id,
            booking.quantity,
            booking.amount,
            booking.currency,
            booking.confirmed_at.to_rfc3339(),
        ),
    }
}

#[async_trait]
impl JobHandler for BookingConfirmedMailer {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job.event()? {
            DomainEvent::BookingConfirmed(booking) => self.deliver(booking).await,
            other @ (DomainEvent::BookingCreated(_)
            | DomainEvent::TicketsReserved(_)
            | DomainEvent::TicketsFailed(_)
            | DomainEvent::PaymentRequested(_)
            | DomainEvent::PaymentFailed(_)
            | DomainEvent::PaymentRefundRequested(_)
            | DomainEvent::PaymentRefundCompleted(_)
            | DomainEvent::BookingConfirmRequested(_)
            | DomainEvent::BookingPaymentFailed(_)
            | DomainEvent::BookingCancelled(_)) => {
                bail!("email worker has no handler for {}", other.kind())
            }
        }
    }
}

/// Surfaces dead-lettered jobs to operators. Never retries.
#[derive(Clone, Default)]
pub struct DeadLetterAlert;

#[async_trait]
impl JobHandler for DeadLetterAlert {
    async fn handle(&self, job: &Job) -> Result<()> {
        let letter: DeadLetter =
            serde_json::from_value(job.payload.clone()).context("malformed dead letter")?;
        error!(
            alert = true,
            job_id = %letter.job_id,
            job = %letter.job_name,
            source_queue = %letter.source_queue,
            total_attempts = letter.total_attempts,
            failed_at = %letter.failed_at.to_rfc3339(),
            failure_reason = %letter.failure_reason,
            "job dead-lettered, operator action required"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::SimulatedMailer;
    use chrono::Utc;
    use shared::queue::MemoryQueue;
    use shared::retry::{RetryPolicy, NOTIFICATION_MAX_RETRIES};
    use shared::{JobOutcome, Queue, Worker};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingSender {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MailSender for CountingSender {
        async fn send(&self, _message: &MailMessage) -> Result<(), MailError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(MailError::Unavailable("smtp connection refused".to_string()));
            }
            Ok(())
        }
    }

    fn confirmed_job() -> Job {
        let event = DomainEvent::BookingConfirmed(BookingConfirmed {
            booking_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            user_email: "fan@example.com".to_string(),
            event_id: Uuid::new_v4(),
            ticket_type_id: Uuid::new_v4(),
            quantity: 2,
            amount: 60.into(),
            currency: "USD".to_string(),
            payment_intent_id: Some("pi_1".to_string()),
            confirmed_at: Utc::now(),
        });
        Job::from_event(&event).unwrap()
    }

    fn email_worker(sender: Arc<CountingSender>, queue: &MemoryQueue) -> Worker<BookingConfirmedMailer> {
        Worker::new(
            Queue::Email,
            BookingConfirmedMailer::new(sender, Duration::from_secs(5)),
            Arc::new(queue.clone()),
            RetryPolicy::notifications(),
        )
    }

    /// Feeds the worker its own requeued jobs until the email queue is empty.
    async fn drain(worker: &Worker<BookingConfirmedMailer>, queue: &MemoryQueue, first: Job) -> Vec<JobOutcome> {
        let mut outcomes = vec![worker.process(first).await.unwrap()];
        loop {
            let jobs = queue.drain(Queue::Email);
            if jobs.is_empty() {
                return outcomes;
            }
            for job in jobs {
                outcomes.push(worker.process(job).await.unwrap());
            }
        }
    }

    #[tokio::test]
    async fn always_failing_delivery_is_dead_lettered_once() {
        let sender = Arc::new(CountingSender {
            fail_first: u32::MAX,
            ..Default::default()
        });
        let queue = MemoryQueue::new();
        let worker = email_worker(sender.clone(), &queue);
        let job = confirmed_job();

        let outcomes = drain(&worker, &queue, job.clone()).await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), NOTIFICATION_MAX_RETRIES + 1);
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Requeued { attempt: 1 },
                JobOutcome::Requeued { attempt: 2 },
                JobOutcome::Requeued { attempt: 3 },
                JobOutcome::DeadLettered { total_attempts: 4 },
            ]
        );

        let dead = queue.drain(Queue::EmailDeadLetter);
        assert_eq!(dead.len(), 1);
        let wire = &dead[0].payload;
        assert_eq!(wire["totalAttempts"], 4);
        assert_eq!(wire["booking_id"], job.payload["booking_id"]);
        assert_eq!(wire["user_email"], "fan@example.com");
        assert!(wire["failureReason"].as_str().unwrap().contains("smtp connection refused"));
        assert!(chrono::DateTime::parse_from_rfc3339(wire["failedAt"].as_str().unwrap()).is_ok());

        assert!(DeadLetterAlert.handle(&dead[0]).await.is_ok());
    }

    #[tokio::test]
    async fn delivery_that_recovers_is_not_dead_lettered() {
        let sender = Arc::new(CountingSender {
            fail_first: 2,
            ..Default::default()
        });
        let queue = MemoryQueue::new();
        let worker = email_worker(sender.clone(), &queue);

        let outcomes = drain(&worker, &queue, confirmed_job()).await;

        assert_eq!(outcomes.last(), Some(&JobOutcome::Done));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.len(Queue::EmailDeadLetter), 0);
    }

    #[tokio::test]
    async fn rejected_recipient_is_dead_lettered_without_retrying() {
        let queue = MemoryQueue::new();
        let worker = Worker::new(
            Queue::Email,
            BookingConfirmedMailer::new(Arc::new(SimulatedMailer::new(0.0)), Duration::from_secs(5)),
            Arc::new(queue.clone()),
            RetryPolicy::notifications(),
        );
        let mut job = confirmed_job();
        job.payload["user_email"] = serde_json::json!("not-an-address");

        let outcome = worker.process(job).await.unwrap();

        assert_eq!(outcome, JobOutcome::DeadLettered { total_attempts: 1 });
        assert_eq!(queue.len(Queue::Email), 0);
        let dead = queue.drain(Queue::EmailDeadLetter);
        assert_eq!(dead.len(), 1);
        assert!(dead[0].payload["failureReason"]
            .as_str()
            .unwrap()
            .contains("invalid recipient"));
    }

    #[tokio::test]
    async fn other_jobs_are_refused() {
        let sender = Arc::new(CountingSender::default());
        let mailer = BookingConfirmedMailer::new(sender.clone(), Duration::from_secs(5));
        let mut job = confirmed_job();
        job.name = "booking.cancelled".to_string();

        assert!(mailer.handle(&job).await.is_err());
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_dead_letter_is_an_error() {
        let job = Job {
            id: Uuid::new_v4(),
            name: "booking.confirmed".to_string(),
            aggregate_id: Uuid::new_v4(),
            payload: serde_json::json!({ "nope": true }),
            attempt: 0,
        };
        assert!(DeadLetterAlert.handle(&job).await.is_err());
    }
}
