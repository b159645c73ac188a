use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Policy parameters frozen onto a record when it is created.
///
/// Later changes to the tracker configuration do not touch records that
/// already exist; only `EventTrackerService::update_config` rewrites a
/// stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Occurrences admitted before the counter strategy defers the key
    pub limit: u64,

    /// Delay between deferral and the record becoming due, in milliseconds
    pub defer_interval_ms: u64,

    /// Idle window after which the record is treated as absent, in milliseconds
    pub expire_time_ms: u64,

    /// Token bucket capacity, set by the token bucket strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<u64>,

    /// Token bucket refill rate in tokens per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,
}

impl RecordConfig {
    pub fn defer_interval(&self) -> Duration {
        millis_to_duration(self.defer_interval_ms)
    }

    pub fn expire_time(&self) -> Duration {
        millis_to_duration(self.expire_time_ms)
    }

    /// Merge a partial update. Fields left as `None` keep their value.
    pub fn apply(&mut self, patch: &RecordConfigPatch) {
        if let Some(limit) = patch.limit {
            self.limit = limit;
        }
        if let Some(defer_interval_ms) = patch.defer_interval_ms {
            self.defer_interval_ms = defer_interval_ms;
        }
        if let Some(expire_time_ms) = patch.expire_time_ms {
            self.expire_time_ms = expire_time_ms;
        }
        if let Some(bucket_size) = patch.bucket_size {
            self.bucket_size = Some(bucket_size);
        }
        if let Some(refill_rate) = patch.refill_rate {
            self.refill_rate = Some(refill_rate);
        }
    }
}

/// Partial update for a stored record's config snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordConfigPatch {
    pub limit: Option<u64>,
    pub defer_interval_ms: Option<u64>,
    pub expire_time_ms: Option<u64>,
    pub bucket_size: Option<u64>,
    pub refill_rate: Option<f64>,
}

/// Persisted state for one (category, identifier) stream
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub key: String,
    pub category: String,
    pub identifier: String,
    pub details: serde_json::Value,
    pub details_fingerprint: String,
    pub count: u64,
    pub last_event_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub deferred: bool,
    pub scheduled_send_at: Option<DateTime<Utc>>,
    pub config: RecordConfig,
    /// Strategy-private state, `Null` when the strategy keeps none
    pub strategy_data: serde_json::Value,
}

impl EventRecord {
    /// Build the record for the first occurrence of a key.
    pub fn first_occurrence(
        occurrence: &EventOccurrence,
        config: RecordConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = add_saturating(now, config.expire_time());
        Self {
            key: occurrence.key.clone(),
            category: occurrence.category.clone(),
            identifier: occurrence.identifier.clone(),
            details: occurrence.details.clone(),
            details_fingerprint: occurrence.details_fingerprint.clone(),
            count: 1,
            last_event_time: now,
            expires_at,
            deferred: false,
            scheduled_send_at: None,
            config,
            strategy_data: serde_json::Value::Null,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// A stored record only counts as present when it is still live and
    /// describes the same payload as the incoming occurrence.
    pub fn is_current_for(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.details_fingerprint == fingerprint
    }

    /// Fold another occurrence in: bump the count and slide the expiry window.
    pub fn record_occurrence(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        self.last_event_time = now;
        self.refresh_expiry();
    }

    pub fn refresh_expiry(&mut self) {
        self.expires_at = add_saturating(self.last_event_time, self.config.expire_time());
    }

    pub fn defer_until(&mut self, scheduled_send_at: DateTime<Utc>) {
        self.deferred = true;
        self.scheduled_send_at = Some(scheduled_send_at);
    }

    pub fn clear_deferral(&mut self) {
        self.deferred = false;
        self.scheduled_send_at = None;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deferred && self.scheduled_send_at.is_some_and(|at| at <= now)
    }
}

/// One incoming occurrence after key derivation, as seen by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct EventOccurrence {
    pub key: String,
    pub category: String,
    pub identifier: String,
    pub details: serde_json::Value,
    pub details_fingerprint: String,
    /// Tracker-wide policy defaults, snapshotted onto new records
    pub config: RecordConfig,
}

/// What the tracker decided for a single occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOutcome {
    Immediate,
    Deferred,
    Ignored,
}

impl fmt::Display for TrackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Deferred => write!(f, "deferred"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

/// Why an occurrence was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The distinct-key cap is reached and the key is not tracked yet
    KeyLimitReached,
    /// The key is already deferred and waiting to be drained
    AlreadyDeferred,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyLimitReached => write!(f, "key_limit_reached"),
            Self::AlreadyDeferred => write!(f, "already_deferred"),
        }
    }
}

pub(crate) fn millis_to_duration(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// `at + delta`, clamped to the latest representable instant
pub(crate) fn add_saturating(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
