use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail rejected by provider: {0}")]
    Rejected(String),
    #[error("mail provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Logs instead of sending, failing a configurable share of deliveries.
pub struct SimulatedMailer {
    failure_rate: f64,
}

impl SimulatedMailer {
    pub fn new(failure_rate: f64) -> Self {
        Self { failure_rate }
    }
}

#[async_trait]
impl MailSender for SimulatedMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        if !message.to.contains('@') {
            return Err(MailError::Rejected(format!("invalid recipient {:?}", message.to)));
        }
        if rand::random::<f64>() < self.failure_rate {
            return Err(MailError::Unavailable("simulated provider outage".to_string()));
        }
        info!(to = %message.to, subject = %message.subject, "email sent");
        Ok(())
    }
}
