use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};

use super::{Job, JobPublisher, PublishError, Queue};

/// Publishes jobs as JSON records keyed by aggregate id, so every event of
/// one aggregate lands on the same partition.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic_prefix: impl Into<String>) -> Self {
        Self {
            producer,
            topic_prefix: topic_prefix.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn topic(&self, queue: Queue) -> String {
        topic_name(&self.topic_prefix, queue)
    }
}

pub fn topic_name(prefix: &str, queue: Queue) -> String {
    if prefix.is_empty() {
        queue.as_str().to_string()
    } else {
        format!("{}.{}", prefix, queue.as_str())
    }
}

#[async_trait]
impl JobPublisher for KafkaPublisher {
    async fn publish(&self, queue: Queue, job: &Job) -> Result<(), PublishError> {
        let json = serde_json::to_string(job).map_err(|source| PublishError::Encode {
            job_id: job.id,
            source,
        })?;
        let key = job.aggregate_id.to_string();
        let topic = self.topic(queue);
        let record = FutureRecord::to(&topic).payload(&json).key(&key);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| PublishError::Broker {
                queue,
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_carry_the_deployment_prefix() {
        assert_eq!(topic_name("", Queue::Ticket), "ticket-saga");
        assert_eq!(topic_name("staging", Queue::EmailDeadLetter), "staging.email-dead-letter");
    }
}
