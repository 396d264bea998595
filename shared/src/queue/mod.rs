//! Job queues between the dispatcher and the worker pools.

mod kafka;
mod memory;

pub use kafka::{topic_name, KafkaPublisher};
pub use memory::MemoryQueue;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{DomainEvent, EventError, EventKind};
use crate::models::OutboxEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Queue {
    Ticket,
    Booking,
    Payment,
    Email,
    EmailDeadLetter,
    SagaDeadLetter,
}

impl Queue {
    pub const ALL: [Queue; 6] = [
        Queue::Ticket,
        Queue::Booking,
        Queue::Payment,
        Queue::Email,
        Queue::EmailDeadLetter,
        Queue::SagaDeadLetter,
    ];

    /// Base topic name, before any deployment prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Ticket => "ticket-saga",
            Queue::Booking => "booking-saga",
            Queue::Payment => "payment-saga",
            Queue::Email => "email",
            Queue::EmailDeadLetter => "email-dead-letter",
            Queue::SagaDeadLetter => "saga-dead-letter",
        }
    }

    /// Where jobs that exhaust their retries on this queue end up.
    pub fn dead_letter(self) -> Option<Queue> {
        match self {
            Queue::Ticket | Queue::Booking | Queue::Payment => Some(Queue::SagaDeadLetter),
            Queue::Email => Some(Queue::EmailDeadLetter),
            Queue::EmailDeadLetter | Queue::SagaDeadLetter => None,
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Queue(Queue),
    /// Recorded for audit only; no worker consumes it.
    Terminal,
}

/// Wire format of every queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempt: u32,
}

impl Job {
    pub fn from_outbox(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            name: event.event_type.clone(),
            aggregate_id: event.aggregate_id,
            payload: event.payload.clone(),
            attempt: 0,
        }
    }

    pub fn from_event(event: &DomainEvent) -> Result<Self, EventError> {
        Ok(Self {
            id: Uuid::new_v4(),
            name: event.kind().as_str().to_string(),
            aggregate_id: event.aggregate_id(),
            payload: event.payload()?,
            attempt: 0,
        })
    }

    pub fn kind(&self) -> Result<EventKind, EventError> {
        self.name.parse()
    }

    pub fn event(&self) -> Result<DomainEvent, EventError> {
        DomainEvent::parse(&self.name, &self.payload)
    }

    /// The same message again, as a new delivery with the next attempt number.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn dead_letter(&self, queue: Queue, failure_reason: String, failed_at: DateTime<Utc>) -> DeadLetter {
        let payload = match &self.payload {
            serde_json::Value::Object(fields) => fields.clone(),
            other => {
                let mut fields = serde_json::Map::new();
                fields.insert("payload".to_string(), other.clone());
                fields
            }
        };
        DeadLetter {
            job_id: self.id,
            job_name: self.name.clone(),
            source_queue: queue,
            payload,
            failure_reason,
            failed_at,
            total_attempts: self.attempt + 1,
        }
    }
}

/// The original payload plus the reason delivery was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub job_name: String,
    pub source_queue: Queue,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub total_attempts: u32,
}

impl DeadLetter {
    /// Wraps the record for the dead-letter queue, keeping the original
    /// aggregate as the partition key.
    pub fn into_job(self, aggregate_id: Uuid) -> Result<Job, serde_json::Error> {
        Ok(Job {
            id: Uuid::new_v4(),
            name: self.job_name.clone(),
            aggregate_id,
            payload: serde_json::to_value(&self)?,
            attempt: 0,
        })
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode job {job_id}: {source}")]
    Encode {
        job_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode dead letter for job {job_id}: {source}")]
    DeadLetter {
        job_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to publish to {queue}: {reason}")]
    Broker { queue: Queue, reason: String },
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, queue: Queue, job: &Job) -> Result<(), PublishError>;
}
