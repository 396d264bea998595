use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Job, JobPublisher, PublishError, Queue};

/// In-process queue used by tests and single-process runs.
///
/// `fail_next(n)` makes the next `n` publishes fail, which is how tests drive
/// the dispatcher's reconciliation path.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    jobs: Arc<Mutex<HashMap<Queue, Vec<Job>>>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, publishes: usize) {
        self.failures.store(publishes, Ordering::SeqCst);
    }

    /// Removes and returns everything waiting on `queue`, oldest first.
    pub fn drain(&self, queue: Queue) -> Vec<Job> {
        self.jobs
            .lock()
            .map(|mut jobs| jobs.remove(&queue).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: Queue) -> usize {
        self.jobs
            .lock()
            .map(|jobs| jobs.get(&queue).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.values().all(Vec::is_empty))
            .unwrap_or(true)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish(&self, queue: Queue, job: &Job) -> Result<(), PublishError> {
        if self.take_failure() {
            return Err(PublishError::Broker {
                queue,
                reason: "broker unavailable".to_string(),
            });
        }
        let mut jobs = self.jobs.lock().map_err(|_| PublishError::Broker {
            queue,
            reason: "queue lock poisoned".to_string(),
        })?;
        jobs.entry(queue).or_default().push(job.clone());
        Ok(())
    }
}
