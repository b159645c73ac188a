#![cfg(feature = "integration-tests")]

use chrono::{Duration, Utc};
use common::domain::{IgnoreReason, ManualClock, TrackOutcome};
use event_tracker::domain::{
    EventTrackerBuilder, EventTrackerConfig, EventTrackerService, StoreBackendKind, StrategyKind,
    TrackerNotification,
};
use serde_json::json;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;

async fn start_redis() -> (ContainerAsync<Redis>, String) {
    let redis = Redis::default().start().await.unwrap();
    let host = redis.get_host().await.unwrap();
    let port = redis.get_host_port_ipv4(6379).await.unwrap();
    (redis, format!("redis://{}:{}", host, port))
}

fn redis_config(url: &str) -> EventTrackerConfig {
    EventTrackerConfig {
        limit: 3,
        defer_interval_ms: 60_000,
        store_backend: StoreBackendKind::Redis,
        redis_url: Some(url.to_string()),
        ..Default::default()
    }
}

// Records carry a backend expiry, so the clock must stay close to wall time
async fn build_tracker(
    config: EventTrackerConfig,
) -> (Arc<EventTrackerService>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let tracker = EventTrackerBuilder::new()
        .with_config(config)
        .with_clock(clock.clone())
        .build()
        .await
        .expect("Failed to build tracker");
    (tracker, clock)
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_counter_lifecycle_over_redis() {
    let (_container, url) = start_redis().await;
    let (tracker, clock) = build_tracker(redis_config(&url)).await;
    let details = json!({"host": "db-1", "code": 504});

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let result = tracker
            .track_event("database", "timeout", details.clone())
            .await
            .unwrap();
        outcomes.push(result.outcome);
    }
    assert_eq!(
        outcomes,
        vec![
            TrackOutcome::Immediate,
            TrackOutcome::Immediate,
            TrackOutcome::Immediate,
            TrackOutcome::Deferred,
            TrackOutcome::Ignored,
        ]
    );

    let deferred = tracker.get_deferred_events().await.unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].count, 5);
    assert_eq!(deferred[0].details, details);
    assert!(tracker.process_deferred_events().await.unwrap().is_empty());

    clock.advance(Duration::minutes(1));
    let batch = tracker.process_deferred_events().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert!(tracker.process_deferred_events().await.unwrap().is_empty());

    let result = tracker
        .track_event("database", "timeout", details)
        .await
        .unwrap();
    assert_eq!(result.outcome, TrackOutcome::Immediate);
    assert_eq!(result.record.unwrap().count, 1);

    tracker.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_key_limit_over_redis() {
    let (_container, url) = start_redis().await;
    let config = EventTrackerConfig {
        max_keys: 2,
        ..redis_config(&url)
    };
    let (tracker, _clock) = build_tracker(config).await;

    tracker.track_event("db", "a", json!({})).await.unwrap();
    tracker.track_event("db", "b", json!({})).await.unwrap();
    let denied = tracker.track_event("db", "c", json!({})).await.unwrap();
    let existing = tracker.track_event("db", "a", json!({})).await.unwrap();

    assert_eq!(denied.reason, Some(IgnoreReason::KeyLimitReached));
    assert!(denied.record.is_none());
    assert_eq!(existing.outcome, TrackOutcome::Immediate);
    assert_eq!(existing.record.unwrap().count, 2);

    tracker.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_token_bucket_state_survives_redis_round_trip() {
    let (_container, url) = start_redis().await;
    let config = EventTrackerConfig {
        strategy: StrategyKind::TokenBucket,
        bucket_size: 2,
        refill_rate: 1.0,
        ..redis_config(&url)
    };
    let (tracker, clock) = build_tracker(config).await;

    let first = tracker.track_event("api", "burst", json!({})).await.unwrap();
    let second = tracker.track_event("api", "burst", json!({})).await.unwrap();
    let third = tracker.track_event("api", "burst", json!({})).await.unwrap();
    assert_eq!(first.outcome, TrackOutcome::Immediate);
    assert_eq!(second.outcome, TrackOutcome::Immediate);
    assert_eq!(third.outcome, TrackOutcome::Deferred);

    clock.advance(Duration::seconds(1));
    let refilled = tracker.track_event("api", "burst", json!({})).await.unwrap();
    assert_eq!(refilled.outcome, TrackOutcome::Immediate);
    assert!(tracker.get_deferred_events().await.unwrap().is_empty());

    tracker.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_config_update_persists_over_redis() {
    let (_container, url) = start_redis().await;
    let (tracker, _clock) = build_tracker(redis_config(&url)).await;
    let mut rx = tracker.subscribe();

    tracker.track_event("db", "x", json!({})).await.unwrap();
    let patch = common::domain::RecordConfigPatch {
        limit: Some(1),
        ..Default::default()
    };
    assert!(tracker.update_config("db", "x", patch).await.unwrap());

    let result = tracker.track_event("db", "x", json!({})).await.unwrap();
    assert_eq!(result.outcome, TrackOutcome::Deferred);

    let mut config_updates = 0;
    while let Ok(notification) = rx.try_recv() {
        if let TrackerNotification::ConfigUpdated(record) = notification {
            assert_eq!(record.config.limit, 1);
            config_updates += 1;
        }
    }
    assert_eq!(config_updates, 1);

    tracker.shutdown().await.unwrap();
}
