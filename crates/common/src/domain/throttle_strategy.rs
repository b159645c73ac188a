use crate::domain::{EventOccurrence, EventRecord, TrackOutcome};
use chrono::{DateTime, Utc};

/// Result of running one occurrence through a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDecision {
    pub outcome: TrackOutcome,
    /// The record to persist in place of the existing one
    pub record: EventRecord,
}

/// Admission policy applied per key.
///
/// A strategy is pure decision logic: it receives the current record (already
/// screened for expiry and fingerprint changes by the caller) and returns the
/// record that should be stored next. It never touches storage.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait ThrottleStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Decide the outcome for `occurrence` given the live record, if any
    fn decide(
        &self,
        existing: Option<EventRecord>,
        occurrence: &EventOccurrence,
        now: DateTime<Utc>,
    ) -> StrategyDecision;
}
