use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::models::OutboxEvent;
use shared::{metrics, Job, JobPublisher, OutboxStore, Route, StoreError};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    /// How long a row may sit in DISPATCHED before it is published again.
    pub publish_timeout: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            publish_timeout: chrono::Duration::seconds(60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub dispatched: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub unroutable: usize,
    /// Rows another dispatcher advanced first.
    pub lost_races: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous sweep was still running.
    Skipped,
    Completed(SweepReport),
}

/// Moves outbox rows onto their queues.
///
/// A row is marked DISPATCHED before it is published. If the publish fails
/// the mark stays, and the reconciliation sweep publishes it again once it
/// has been DISPATCHED for longer than `publish_timeout`.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    publisher: Arc<dyn JobPublisher>,
    config: DispatcherConfig,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        publisher: Arc<dyn JobPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            publisher,
            config,
            busy: AtomicBool::new(false),
        }
    }

    /// Runs both sweeps until the task is dropped. Dispatch ticks that fire
    /// while a sweep is in flight are skipped, never queued.
    pub async fn run(self: Arc<Self>, dispatch_every: Duration, reconcile_every: Duration) {
        let mut dispatch = time::interval(dispatch_every);
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = time::interval(reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = dispatch.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.tick().await {
                            error!("Error processing outbox events: {}", e);
                        }
                    });
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        error!("Error reconciling outbox events: {}", e);
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous outbox sweep still running, skipping tick");
            return Ok(TickOutcome::Skipped);
        }
        let _guard = BusyGuard(&self.busy);
        let report = self.dispatch_pending().await?;
        Ok(TickOutcome::Completed(report))
    }

    async fn dispatch_pending(&self) -> Result<SweepReport, StoreError> {
        let pending = self.outbox.list_pending(self.config.batch_size).await?;
        let mut report = SweepReport::default();

        for event in pending {
            let route = match event.kind() {
                Ok(kind) => kind.route(),
                Err(e) => {
                    error!(event_id = %event.id, event_type = %event.event_type, "event is not routable, parking it: {}", e);
                    report.unroutable += 1;
                    // Parked rows stay DISPATCHED; reconciliation only lists known types.
                    if let Err(e) = self.outbox.mark_dispatched(event.id).await {
                        error!(event_id = %event.id, "failed to park unroutable event: {}", e);
                    }
                    continue;
                }
            };

            match self.outbox.mark_dispatched(event.id).await {
                Ok(true) => {}
                Ok(false) => {
                    report.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    error!(event_id = %event.id, "failed to mark event dispatched: {}", e);
                    continue;
                }
            }
            report.dispatched += 1;
            metrics::record_outbox_dispatched(match route {
                Route::Queue(queue) => Some(queue),
                Route::Terminal => None,
            });

            if self.publish(&event, route).await {
                report.published += 1;
            } else {
                report.publish_failures += 1;
            }
        }

        if report.dispatched > 0 || report.unroutable > 0 {
            info!(
                dispatched = report.dispatched,
                published = report.published,
                failures = report.publish_failures,
                unroutable = report.unroutable,
                "outbox sweep finished"
            );
        }
        Ok(report)
    }

    /// Publishes DISPATCHED rows that were never confirmed as PUBLISHED.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let cutoff = now - self.config.publish_timeout;
        let stale = self
            .outbox
            .list_unpublished(cutoff, self.config.batch_size)
            .await?;
        let mut report = SweepReport::default();

        for event in stale {
            let route = match event.kind() {
                Ok(kind) => kind.route(),
                Err(e) => {
                    report.unroutable += 1;
                    debug!(event_id = %event.id, "skipping unroutable event: {}", e);
                    continue;
                }
            };
            warn!(event_id = %event.id, event_type = %event.event_type, "re-publishing unconfirmed event");
            if self.publish(&event, route).await {
                metrics::record_outbox_republished();
                report.published += 1;
            } else {
                report.publish_failures += 1;
            }
        }
        Ok(report)
    }

    /// Returns whether the row reached PUBLISHED. Failures are logged and left
    /// for reconciliation.
    async fn publish(&self, event: &OutboxEvent, route: Route) -> bool {
        if let Route::Queue(queue) = route {
            let job = Job::from_outbox(event);
            if let Err(e) = self.publisher.publish(queue, &job).await {
                metrics::record_outbox_publish_failure();
                error!(event_id = %event.id, %queue, "Failed to publish event: {}", e);
                return false;
            }
        }

        match self.outbox.mark_published(event.id).await {
            Ok(_) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "published outbox event");
                true
            }
            Err(e) => {
                error!(event_id = %event.id, "failed to mark event published: {}", e);
                false
            }
        }
    }
}
