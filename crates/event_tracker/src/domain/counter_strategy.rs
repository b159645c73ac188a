use chrono::{DateTime, Utc};
use common::domain::{
    EventOccurrence, EventRecord, StrategyDecision, ThrottleStrategy, TrackOutcome,
};
use tracing::debug;

/// Admits the first `limit` occurrences of a key, then defers it once.
///
/// Deferral is sticky: further occurrences are ignored (while still being
/// counted) until the record is drained or expires. The defer window is not
/// extended by later floods.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterStrategy;

impl CounterStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ThrottleStrategy for CounterStrategy {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn decide(
        &self,
        existing: Option<EventRecord>,
        occurrence: &EventOccurrence,
        now: DateTime<Utc>,
    ) -> StrategyDecision {
        let mut record = match existing {
            Some(mut record) => {
                record.record_occurrence(now);
                if record.deferred {
                    debug!(key = %record.key, count = record.count, "key already deferred");
                    return StrategyDecision {
                        outcome: TrackOutcome::Ignored,
                        record,
                    };
                }
                record
            }
            None => EventRecord::first_occurrence(occurrence, occurrence.config.clone(), now),
        };

        if record.count <= record.config.limit {
            return StrategyDecision {
                outcome: TrackOutcome::Immediate,
                record,
            };
        }

        let scheduled_send_at = now
            .checked_add_signed(record.config.defer_interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        record.defer_until(scheduled_send_at);
        debug!(
            key = %record.key,
            count = record.count,
            limit = record.config.limit,
            %scheduled_send_at,
            "limit exceeded, deferring key"
        );

        StrategyDecision {
            outcome: TrackOutcome::Deferred,
            record,
        }
    }
}
