//! Queue consumer loop shared by every worker pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset};
use tracing::{error, info, warn};

use crate::metrics;
use crate::queue::{Job, JobPublisher, PublishError, Queue};
use crate::retry::{RetryDecision, RetryPolicy};

const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: Duration = Duration::from_millis(200);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// An `Err` is retried under the worker's `RetryPolicy`, unless it
    /// carries [`Permanent`], in which case it is dead-lettered at once.
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        (**self).handle(job).await
    }
}

/// Context marker for a failure that redelivery cannot fix.
#[derive(Debug, Clone, Copy)]
pub struct Permanent;

impl fmt::Display for Permanent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("permanent failure")
    }
}

/// Wraps `err` so the worker skips its remaining retries.
pub fn permanent(err: impl Into<anyhow::Error>) -> anyhow::Error {
    err.into().context(Permanent)
}

pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Permanent>().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Requeued { attempt: u32 },
    DeadLettered { total_attempts: u32 },
    /// Failed on a queue with nowhere further to go; logged and dropped.
    Abandoned,
}

pub struct Worker<H> {
    queue: Queue,
    handler: H,
    publisher: Arc<dyn JobPublisher>,
    policy: RetryPolicy,
    settle_attempts: u32,
    settle_backoff: Duration,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(queue: Queue, handler: H, publisher: Arc<dyn JobPublisher>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            handler,
            publisher,
            policy,
            settle_attempts: SETTLE_ATTEMPTS,
            settle_backoff: SETTLE_BACKOFF,
        }
    }

    /// How many times a requeue or dead-letter publish is tried, and the
    /// first delay between tries. The delay doubles after each failure.
    pub fn with_settle_backoff(mut self, attempts: u32, backoff: Duration) -> Self {
        self.settle_attempts = attempts.max(1);
        self.settle_backoff = backoff;
        self
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Runs one delivery. A retry is published as a new message rather than
    /// requeued in place, so every attempt is counted.
    ///
    /// If the retry cannot be published the job is dead-lettered instead.
    /// An `Err` means neither publish went through and the delivery must
    /// not be acknowledged.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, PublishError> {
        let err = match self.handler.handle(&job).await {
            Ok(()) => return Ok(JobOutcome::Done),
            Err(e) => e,
        };
        let reason = format!("{err:#}");

        let decision = if is_permanent(&err) {
            RetryDecision::DeadLetter {
                total_attempts: job.attempt + 1,
            }
        } else {
            self.policy.on_failure(job.attempt)
        };

        match decision {
            RetryDecision::Retry { next_attempt } => {
                warn!(
                    queue = %self.queue,
                    job_id = %job.id,
                    job = %job.name,
                    attempt = job.attempt,
                    error = %reason,
                    "job failed, requeueing"
                );
                match self.settle(self.queue, &job.next_attempt()).await {
                    Ok(()) => {
                        metrics::record_requeued(self.queue);
                        Ok(JobOutcome::Requeued {
                            attempt: next_attempt,
                        })
                    }
                    Err(e) if self.queue.dead_letter().is_some() => {
                        error!(queue = %self.queue, job_id = %job.id, "requeue failed, dead-lettering instead: {}", e);
                        self.dead_letter(&job, reason, job.attempt + 1).await
                    }
                    Err(e) => Err(e),
                }
            }
            RetryDecision::DeadLetter { total_attempts } => self.dead_letter(&job, reason, total_attempts).await,
        }
    }

    async fn dead_letter(&self, job: &Job, reason: String, total_attempts: u32) -> Result<JobOutcome, PublishError> {
        let Some(dead_letter_queue) = self.queue.dead_letter() else {
            error!(
                queue = %self.queue,
                job_id = %job.id,
                job = %job.name,
                error = %reason,
                "job failed on a dead-letter queue, dropping"
            );
            return Ok(JobOutcome::Abandoned);
        };
        let mut letter = job.dead_letter(self.queue, reason, Utc::now());
        letter.total_attempts = total_attempts;
        let dead = letter
            .into_job(job.aggregate_id)
            .map_err(|source| PublishError::DeadLetter {
                job_id: job.id,
                source,
            })?;
        self.settle(dead_letter_queue, &dead).await?;
        metrics::record_dead_lettered(self.queue);
        error!(
            queue = %self.queue,
            job_id = %job.id,
            job = %job.name,
            total_attempts,
            "job dead-lettered"
        );
        Ok(JobOutcome::DeadLettered { total_attempts })
    }

    async fn settle(&self, queue: Queue, job: &Job) -> Result<(), PublishError> {
        let mut delay = self.settle_backoff;
        let mut tries = 1;
        loop {
            match self.publisher.publish(queue, job).await {
                Ok(()) => return Ok(()),
                Err(e) if tries < self.settle_attempts => {
                    warn!(%queue, job_id = %job.id, tries, "publish failed, backing off: {}", e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consumes `consumer` until the stream ends. A message is committed
    /// once it has been settled. A job that could not be settled is not
    /// committed; the partition is rewound to it so it is delivered again.
    pub async fn run(&self, consumer: StreamConsumer) {
        info!(queue = %self.queue, "worker started");
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let settled = match m.payload_view::<str>() {
                        Some(Ok(json)) => match serde_json::from_str::<Job>(json) {
                            Ok(job) => match self.process(job).await {
                                Ok(_) => true,
                                Err(e) => {
                                    error!(queue = %self.queue, offset = m.offset(), "error settling job, redelivering: {}", e);
                                    false
                                }
                            },
                            Err(e) => {
                                error!(queue = %self.queue, "malformed job: {}", e);
                                true
                            }
                        },
                        Some(Err(e)) => {
                            error!(queue = %self.queue, "error parsing payload: {}", e);
                            true
                        }
                        None => {
                            warn!(queue = %self.queue, "empty message");
                            true
                        }
                    };

                    if settled {
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            error!(queue = %self.queue, "error committing message: {}", e);
                        }
                    } else if let Err(e) =
                        consumer.seek(m.topic(), m.partition(), Offset::Offset(m.offset()), SEEK_TIMEOUT)
                    {
                        error!(queue = %self.queue, "error rewinding to unsettled message: {}", e);
                    }
                }
                Err(e) => error!(queue = %self.queue, "error receiving message: {}", e),
            }
        }
    }
}
