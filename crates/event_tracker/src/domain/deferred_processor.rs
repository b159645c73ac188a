use crate::domain::EventTrackerService;
use async_trait::async_trait;
use common::domain::EventRecord;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Consumer of drained deferred records
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeferredEventHandler: Send + Sync {
    async fn handle(&self, batch: Vec<EventRecord>) -> anyhow::Result<()>;
}

/// Periodically drains due deferred records into a handler.
///
/// Failures from draining or from the handler are logged and published as
/// `TrackerNotification::Error`; the loop keeps ticking. Cancelling the
/// token stops future ticks but lets an in-flight tick finish. The processor
/// only holds a weak reference to the tracker and also stops once the last
/// strong reference is dropped.
pub struct DeferredEventProcessor {
    service: Weak<EventTrackerService>,
    handler: Arc<dyn DeferredEventHandler>,
    interval: Duration,
}

impl DeferredEventProcessor {
    pub fn new(
        service: &Arc<EventTrackerService>,
        handler: Arc<dyn DeferredEventHandler>,
        interval: Duration,
    ) -> Self {
        Self {
            service: Arc::downgrade(service),
            handler,
            interval,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "deferred event processor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately on the first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("deferred event processor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.tick().await {
                        info!("event tracker dropped, deferred event processor stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Run one drain cycle. Returns `false` once the tracker is gone.
    pub async fn tick(&self) -> bool {
        let Some(service) = self.service.upgrade() else {
            return false;
        };

        let batch = match service.process_deferred_events().await {
            Ok(batch) => batch,
            Err(e) => {
                error!("failed to process deferred events: {}", e);
                service.report_error(format!("failed to process deferred events: {}", e));
                return true;
            }
        };

        if batch.is_empty() {
            return true;
        }

        let size = batch.len();
        match self.handler.handle(batch).await {
            Ok(()) => debug!(size, "deferred batch handled"),
            Err(e) => {
                error!(size, "deferred event handler failed: {:#}", e);
                service.report_error(format!("deferred event handler failed: {:#}", e));
            }
        }
        true
    }
}
