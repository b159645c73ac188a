use crate::domain::{EventTrackerConfig, IgnoredEvent, Notifier, TrackResult, TrackerNotification};
use chrono::{DateTime, Utc};
use common::domain::{
    composite_key, details_fingerprint, Clock, DomainError, DomainResult, EventOccurrence,
    EventRecord, EventStore, IgnoreReason, RecordConfigPatch, ThrottleStrategy, TrackOutcome,
};
use common::garde::validate_struct;
use garde::Validate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the notification channel; slow subscribers lag past this
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Input to `EventTrackerService::track`
#[derive(Debug, Clone, Validate)]
pub struct TrackEventRequest {
    #[garde(length(min = 1))]
    pub category: String,
    #[garde(length(min = 1))]
    pub identifier: String,
    #[garde(skip)]
    pub details: serde_json::Value,
}

/// Coordinates key derivation, storage and the throttling strategy.
///
/// Each operation is a single read-decide-write against the store and is
/// not serialized here. With the in-memory store callers must serialize
/// work on a key themselves; with Redis concurrent writers for the same key
/// resolve last-write-wins.
pub struct EventTrackerService {
    store: Arc<dyn EventStore>,
    strategy: Arc<dyn ThrottleStrategy>,
    clock: Arc<dyn Clock>,
    config: EventTrackerConfig,
    notifier: Notifier,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
}

impl EventTrackerService {
    pub fn new(
        store: Arc<dyn EventStore>,
        strategy: Arc<dyn ThrottleStrategy>,
        clock: Arc<dyn Clock>,
        config: EventTrackerConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            clock,
            config,
            notifier: Notifier::new(DEFAULT_NOTIFICATION_CAPACITY),
            shutdown_token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EventTrackerConfig {
        &self.config
    }

    /// Token cancelled by `shutdown`; background loops run on child tokens
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.notifier.subscribe()
    }

    /// Track one occurrence of `(category, identifier)`
    #[instrument(skip(self, details))]
    pub async fn track_event(
        &self,
        category: &str,
        identifier: &str,
        details: serde_json::Value,
    ) -> DomainResult<TrackResult> {
        self.track(TrackEventRequest {
            category: category.to_string(),
            identifier: identifier.to_string(),
            details,
        })
        .await
    }

    /// Track a validated request.
    ///
    /// The `max_keys` guard only applies when nothing is stored under the
    /// key. A stale record (expired or with other details) still holds its
    /// slot and is replaced in place, so `size()` never grows past the cap.
    /// With the in-memory sweep enabled this makes the outcome for an expired
    /// key timing dependent: once swept the key is new and may be denied,
    /// before the sweep it is admitted.
    #[instrument(
        skip(self, request),
        fields(category = %request.category, identifier = %request.identifier)
    )]
    pub async fn track(&self, request: TrackEventRequest) -> DomainResult<TrackResult> {
        validate_struct(&request)?;

        let now = self.clock.now();
        let key = composite_key(&request.category, &request.identifier);
        let fingerprint = details_fingerprint(&request.details);

        let stored = self.store.get(&key).await?;
        let occupies_slot = stored.is_some();
        let existing = match stored {
            Some(record) if record.is_current_for(&fingerprint, now) => Some(record),
            Some(record) => {
                debug!(
                    key = %key,
                    expired = record.is_expired(now),
                    "stored record is stale, starting a new one"
                );
                None
            }
            None => None,
        };

        if !occupies_slot && self.config.max_keys > 0 {
            let size = self.store.size().await?;
            if size as u64 >= self.config.max_keys {
                warn!(
                    size,
                    max_keys = self.config.max_keys,
                    "key limit reached, ignoring new key"
                );
                self.notifier.notify(TrackerNotification::Ignored(IgnoredEvent {
                    reason: IgnoreReason::KeyLimitReached,
                    category: request.category,
                    identifier: request.identifier,
                    details: request.details,
                }));
                return Ok(TrackResult {
                    outcome: TrackOutcome::Ignored,
                    record: None,
                    reason: Some(IgnoreReason::KeyLimitReached),
                });
            }
        }

        let occurrence = EventOccurrence {
            key,
            category: request.category,
            identifier: request.identifier,
            details: request.details,
            details_fingerprint: fingerprint,
            config: self.config.record_defaults(),
        };
        let decision = self.strategy.decide(existing, &occurrence, now);
        let record = decision.record;
        self.store.set(&record.key, &record).await?;

        debug!(
            strategy = self.strategy.name(),
            outcome = %decision.outcome,
            count = record.count,
            "tracked event"
        );
        self.notifier.notify(TrackerNotification::Tracked(record.clone()));

        let reason = match decision.outcome {
            TrackOutcome::Immediate => {
                self.notifier.notify(TrackerNotification::Immediate(record.clone()));
                None
            }
            TrackOutcome::Deferred => {
                self.notifier.notify(TrackerNotification::Deferred(record.clone()));
                None
            }
            TrackOutcome::Ignored => {
                self.notifier.notify(TrackerNotification::Ignored(IgnoredEvent {
                    reason: IgnoreReason::AlreadyDeferred,
                    category: occurrence.category,
                    identifier: occurrence.identifier,
                    details: occurrence.details,
                }));
                Some(IgnoreReason::AlreadyDeferred)
            }
        };

        Ok(TrackResult {
            outcome: decision.outcome,
            record: Some(record),
            reason,
        })
    }

    /// Drain every deferred record that is due, deleting it from the store
    #[instrument(skip(self))]
    pub async fn process_deferred_events(&self) -> DomainResult<Vec<EventRecord>> {
        let now = self.clock.now();
        let due = self.store.find_due_deferred(now).await?;
        if due.is_empty() {
            return Ok(due);
        }

        for record in &due {
            self.store.delete(&record.key).await?;
            self.notifier.notify(TrackerNotification::Processed(record.clone()));
        }

        info!("processed {} deferred events", due.len());
        Ok(due)
    }

    /// Every deferred record, due or not. Nothing is removed.
    #[instrument(skip(self))]
    pub async fn get_deferred_events(&self) -> DomainResult<Vec<EventRecord>> {
        match self.store.find_all_deferred().await? {
            Some(records) => Ok(records),
            None => self.store.find_due_deferred(DateTime::<Utc>::MAX_UTC).await,
        }
    }

    /// Merge `patch` into the config snapshot of a live record.
    ///
    /// Returns `false` without notifying when no live record exists.
    #[instrument(skip(self))]
    pub async fn update_config(
        &self,
        category: &str,
        identifier: &str,
        patch: RecordConfigPatch,
    ) -> DomainResult<bool> {
        validate_patch(&patch)?;

        let now = self.clock.now();
        let key = composite_key(category, identifier);
        let mut record = match self.store.get(&key).await? {
            Some(record) if !record.is_expired(now) => record,
            _ => {
                debug!("no live record to update");
                return Ok(false);
            }
        };

        record.config.apply(&patch);
        record.refresh_expiry();
        self.store.set(&key, &record).await?;

        info!("updated record config");
        self.notifier.notify(TrackerNotification::ConfigUpdated(record));
        Ok(true)
    }

    /// Stop background processing, release store resources and close the
    /// notification channel. Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> DomainResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("tracker already shut down");
            return Ok(());
        }

        info!("shutting down event tracker");
        self.shutdown_token.cancel();
        let result = self.store.destroy().await;
        self.notifier.close();
        result
    }

    pub(crate) fn report_error(&self, message: String) {
        self.notifier.notify(TrackerNotification::Error(message));
    }
}

fn validate_patch(patch: &RecordConfigPatch) -> DomainResult<()> {
    if patch.bucket_size == Some(0) {
        return Err(DomainError::ValidationError(
            "bucket_size: must be at least 1".to_string(),
        ));
    }
    if let Some(rate) = patch.refill_rate {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DomainError::ValidationError(
                "refill_rate: must be a positive number".to_string(),
            ));
        }
    }
    Ok(())
}
