use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::models::CancelReason;
use shared::{metrics, BookingStore, StoreError};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

/// Cancels PENDING bookings past their `expires_at`. Cancelling releases any
/// held tickets in the same transition.
pub struct BookingReaper {
    bookings: Arc<dyn BookingStore>,
    batch_size: i64,
}

impl BookingReaper {
    pub fn new(bookings: Arc<dyn BookingStore>, batch_size: i64) -> Self {
        Self {
            bookings,
            batch_size,
        }
    }

    pub async fn run(&self, every: Duration) {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep(Utc::now()).await {
                error!("Error reaping expired bookings: {}", e);
            }
        }
    }

    /// Returns how many bookings this sweep cancelled.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.bookings.list_expired(now, self.batch_size).await?;
        let mut reaped = 0;

        for booking in expired {
            match self.bookings.cancel_booking(booking.id, CancelReason::Expired).await {
                Ok(transition) if transition.is_applied() => {
                    reaped += 1;
                    metrics::record_booking_expired();
                    metrics::record_booking_failed(CancelReason::Expired);
                    info!(booking_id = %booking.id, expires_at = %booking.expires_at, "expired booking cancelled");
                }
                Ok(_) => {}
                Err(e) => error!(booking_id = %booking.id, "failed to cancel expired booking: {}", e),
            }
        }
        Ok(reaped)
    }
}
