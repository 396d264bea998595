use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment intent {0} not found")]
    NotFound(String),
}

impl GatewayError {
    /// Declines and unknown intents will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Succeeded,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub payment_intent_id: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// The card processor. Calls carrying the same idempotency key return the
/// first call's result, so a redelivered job never charges twice.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: HashMap<String, String>,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn refund(&self, payment_intent_id: &str, idempotency_key: &str) -> Result<RefundReceipt, GatewayError>;

    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError>;
}

#[derive(Default)]
struct Ledger {
    charges: HashMap<String, Result<PaymentIntent, GatewayError>>,
    intents: HashMap<String, PaymentIntent>,
    refunds: HashMap<String, RefundReceipt>,
}

/// Stand-in gateway that approves a share of charges at random.
pub struct SimulatedGateway {
    success_rate: f64,
    outages: AtomicUsize,
    ledger: Mutex<Ledger>,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate,
            outages: AtomicUsize::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// The next `calls` requests fail as unavailable.
    pub fn with_outage(self, calls: usize) -> Self {
        self.outages.store(calls, Ordering::SeqCst);
        self
    }

    fn check_outage(&self) -> Result<(), GatewayError> {
        match self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(GatewayError::Unavailable("simulated outage".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: HashMap<String, String>,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        self.check_outage()?;
        let mut ledger = self.ledger.lock().await;
        if let Some(previous) = ledger.charges.get(idempotency_key) {
            return previous.clone();
        }

        let result = if rand::random::<f64>() < self.success_rate {
            let id = format!("pi_{}", Uuid::new_v4().simple());
            let intent = PaymentIntent {
                client_secret: format!("{}_secret_{}", id, Uuid::new_v4().simple()),
                id,
                amount,
                currency: currency.to_string(),
                status: IntentStatus::Succeeded,
                metadata,
            };
            ledger.intents.insert(intent.id.clone(), intent.clone());
            Ok(intent)
        } else {
            Err(GatewayError::Declined("card declined".to_string()))
        };
        ledger.charges.insert(idempotency_key.to_string(), result.clone());
        result
    }

    async fn refund(&self, payment_intent_id: &str, idempotency_key: &str) -> Result<RefundReceipt, GatewayError> {
        self.check_outage()?;
        let mut ledger = self.ledger.lock().await;
        if let Some(previous) = ledger.refunds.get(idempotency_key) {
            return Ok(previous.clone());
        }
        let intent = ledger
            .intents
            .get_mut(payment_intent_id)
            .ok_or_else(|| GatewayError::NotFound(payment_intent_id.to_string()))?;
        intent.status = IntentStatus::Refunded;
        let receipt = RefundReceipt {
            id: format!("re_{}", Uuid::new_v4().simple()),
            payment_intent_id: payment_intent_id.to_string(),
            amount: intent.amount,
            created_at: Utc::now(),
        };
        ledger.refunds.insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        self.check_outage()?;
        self.ledger
            .lock()
            .await
            .intents
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }
}
