use chrono::{DateTime, Duration, Utc};
use common::domain::{
    EventOccurrence, EventRecord, StrategyDecision, ThrottleStrategy, TrackOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bucket state kept in `EventRecord::strategy_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: u64,
    /// Epoch milliseconds of the last refill that added a whole token
    pub last_refill: i64,
}

impl TokenBucketState {
    fn full(bucket_size: u64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: bucket_size,
            last_refill: now.timestamp_millis(),
        }
    }

    /// Add the whole tokens earned since `last_refill`. Fractional progress
    /// is kept by leaving `last_refill` alone until a token is earned.
    fn refill(&mut self, bucket_size: u64, refill_rate: f64, now: DateTime<Utc>) {
        let elapsed_ms = (now.timestamp_millis() - self.last_refill).max(0);
        let earned = (elapsed_ms as f64 / 1000.0 * refill_rate).floor();
        if earned >= 1.0 {
            self.tokens = self.tokens.saturating_add(earned as u64).min(bucket_size);
            self.last_refill = now.timestamp_millis();
        }
    }
}

/// Rate limiter that lets bursts of `bucket_size` through and then admits
/// `refill_rate` occurrences per second.
///
/// Unlike [`CounterStrategy`](crate::domain::CounterStrategy) a successful
/// admission returns a deferred key to the active state.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketStrategy {
    bucket_size: u64,
    refill_rate: f64,
}

impl TokenBucketStrategy {
    pub fn new(bucket_size: u64, refill_rate: f64) -> Self {
        Self {
            bucket_size,
            refill_rate,
        }
    }

    fn parameters(&self, record: &EventRecord) -> (u64, f64) {
        (
            record.config.bucket_size.unwrap_or(self.bucket_size),
            record.config.refill_rate.unwrap_or(self.refill_rate),
        )
    }

    fn load_state(
        &self,
        record: &EventRecord,
        bucket_size: u64,
        now: DateTime<Utc>,
    ) -> TokenBucketState {
        match serde_json::from_value(record.strategy_data.clone()) {
            Ok(state) => state,
            Err(e) => {
                debug!(key = %record.key, error = %e, "no usable bucket state, starting full");
                TokenBucketState::full(bucket_size, now)
            }
        }
    }
}

impl Default for TokenBucketStrategy {
    fn default() -> Self {
        Self::new(10, 1.0)
    }
}

impl ThrottleStrategy for TokenBucketStrategy {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn decide(
        &self,
        existing: Option<EventRecord>,
        occurrence: &EventOccurrence,
        now: DateTime<Utc>,
    ) -> StrategyDecision {
        let Some(mut record) = existing else {
            let mut config = occurrence.config.clone();
            config.bucket_size = Some(self.bucket_size);
            config.refill_rate = Some(self.refill_rate);

            let mut record = EventRecord::first_occurrence(occurrence, config, now);
            let state = TokenBucketState {
                tokens: self.bucket_size.saturating_sub(1),
                last_refill: now.timestamp_millis(),
            };
            record.strategy_data = serde_json::to_value(state).unwrap_or_default();
            return StrategyDecision {
                outcome: TrackOutcome::Immediate,
                record,
            };
        };

        record.record_occurrence(now);
        let (bucket_size, refill_rate) = self.parameters(&record);
        let mut state = self.load_state(&record, bucket_size, now);
        state.refill(bucket_size, refill_rate, now);

        let outcome = if state.tokens >= 1 {
            state.tokens -= 1;
            record.clear_deferral();
            TrackOutcome::Immediate
        } else {
            let scheduled_send_at = now
                .checked_add_signed(refill_delay(refill_rate, &record))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            record.defer_until(scheduled_send_at);
            debug!(key = %record.key, %scheduled_send_at, "bucket empty, deferring key");
            TrackOutcome::Deferred
        };

        record.strategy_data = serde_json::to_value(state).unwrap_or_default();
        StrategyDecision { outcome, record }
    }
}

/// Time until the next token, falling back to the record's defer interval
/// when the rate cannot produce one
fn refill_delay(refill_rate: f64, record: &EventRecord) -> Duration {
    if refill_rate.is_finite() && refill_rate > 0.0 {
        let ms = (1000.0 / refill_rate).ceil().min(i64::MAX as f64) as i64;
        Duration::milliseconds(ms)
    } else {
        record.config.defer_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::domain::RecordConfig;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn occurrence() -> EventOccurrence {
        EventOccurrence {
            key: "k1".to_string(),
            category: "api".to_string(),
            identifier: "rate".to_string(),
            details: json!({"route": "/login"}),
            details_fingerprint: "fp".to_string(),
            config: RecordConfig {
                limit: 5,
                defer_interval_ms: 60_000,
                expire_time_ms: 3_600_000,
                bucket_size: None,
                refill_rate: None,
            },
        }
    }

    fn bucket(record: &EventRecord) -> TokenBucketState {
        serde_json::from_value(record.strategy_data.clone()).unwrap()
    }

    #[test]
    fn test_creation_consumes_one_token_and_snapshots_parameters() {
        let decision = TokenBucketStrategy::new(5, 1.0).decide(None, &occurrence(), t0());

        assert_eq!(decision.outcome, TrackOutcome::Immediate);
        assert_eq!(decision.record.config.bucket_size, Some(5));
        assert_eq!(decision.record.config.refill_rate, Some(1.0));
        assert_eq!(
            bucket(&decision.record),
            TokenBucketState {
                tokens: 4,
                last_refill: t0().timestamp_millis()
            }
        );
    }

    #[test]
    fn test_burst_then_defer_with_forward_moving_schedule() {
        let strategy = TokenBucketStrategy::new(5, 1.0);
        let mut current = None;
        let mut decisions = Vec::new();
        for i in 0..7 {
            let now = t0() + Duration::milliseconds(100 * i);
            let decision = strategy.decide(current.take(), &occurrence(), now);
            current = Some(decision.record.clone());
            decisions.push(decision);
        }

        let outcomes: Vec<_> = decisions.iter().map(|d| d.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                TrackOutcome::Immediate,
                TrackOutcome::Immediate,
                TrackOutcome::Immediate,
                TrackOutcome::Immediate,
                TrackOutcome::Immediate,
                TrackOutcome::Deferred,
                TrackOutcome::Deferred,
            ]
        );

        let sixth = decisions[5].record.scheduled_send_at.unwrap();
        let seventh = decisions[6].record.scheduled_send_at.unwrap();
        assert_eq!(sixth, t0() + Duration::milliseconds(1_500));
        assert!(seventh > sixth);
        assert_eq!(decisions[6].record.count, 7);
    }

    #[test]
    fn test_refill_undefers_key() {
        let strategy = TokenBucketStrategy::new(1, 1.0);
        let first = strategy.decide(None, &occurrence(), t0());
        let second = strategy.decide(Some(first.record), &occurrence(), t0());
        assert_eq!(second.outcome, TrackOutcome::Deferred);
        assert!(second.record.deferred);

        let later = t0() + Duration::seconds(2);
        let third = strategy.decide(Some(second.record), &occurrence(), later);

        assert_eq!(third.outcome, TrackOutcome::Immediate);
        assert!(!third.record.deferred);
        assert!(third.record.scheduled_send_at.is_none());
        // Refill is capped at the bucket size before the token is taken
        assert_eq!(bucket(&third.record).tokens, 0);
    }

    #[test]
    fn test_partial_refill_keeps_fractional_progress() {
        let mut state = TokenBucketState {
            tokens: 0,
            last_refill: t0().timestamp_millis(),
        };

        state.refill(5, 1.0, t0() + Duration::milliseconds(600));
        assert_eq!(state.tokens, 0);
        assert_eq!(state.last_refill, t0().timestamp_millis());

        state.refill(5, 1.0, t0() + Duration::milliseconds(1_200));
        assert_eq!(state.tokens, 1);
        assert_eq!(
            state.last_refill,
            (t0() + Duration::milliseconds(1_200)).timestamp_millis()
        );
    }

    #[test]
    fn test_missing_state_starts_with_full_bucket() {
        let strategy = TokenBucketStrategy::new(3, 1.0);
        let mut record = strategy.decide(None, &occurrence(), t0()).record;
        record.strategy_data = serde_json::Value::Null;

        let decision = strategy.decide(Some(record), &occurrence(), t0());

        assert_eq!(decision.outcome, TrackOutcome::Immediate);
        assert_eq!(bucket(&decision.record).tokens, 2);
    }

    #[test]
    fn test_record_parameters_override_strategy_defaults() {
        let strategy = TokenBucketStrategy::new(1, 1.0);
        let mut record = strategy.decide(None, &occurrence(), t0()).record;
        record.config.refill_rate = Some(4.0);

        let decision = strategy.decide(Some(record), &occurrence(), t0());

        assert_eq!(decision.outcome, TrackOutcome::Deferred);
        assert_eq!(
            decision.record.scheduled_send_at,
            Some(t0() + Duration::milliseconds(250))
        );
    }
}
