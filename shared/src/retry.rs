//! Bounded retry shared by every worker pool.

/// Notification delivery is retried this many times after the first attempt.
pub const NOTIFICATION_MAX_RETRIES: u32 = 3;

/// Default retry bound for saga jobs.
pub const SAGA_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32 },
    DeadLetter { total_attempts: u32 },
}

impl RetryPolicy {
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub const fn notifications() -> Self {
        Self::new(NOTIFICATION_MAX_RETRIES)
    }

    /// Dead-letter handlers alert once and never retry.
    pub const fn none() -> Self {
        Self::new(0)
    }

    /// `attempt` is zero-based: the first delivery is attempt 0.
    pub fn on_failure(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::DeadLetter {
                total_attempts: attempt + 1,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(SAGA_MAX_RETRIES)
    }
}
