use crate::domain::{
    CounterStrategy, EventTrackerConfig, StoreBackendKind, StrategyKind, TokenBucketStrategy,
};
use common::domain::{Clock, DomainError, DomainResult, EventStore, ThrottleStrategy};
use common::memory::InMemoryEventStore;
use common::redis::{RedisClient, RedisEventStore, RedisEventStoreConfig};
use std::sync::Arc;
use tracing::info;

/// Build the storage backend selected by `config.store_backend`.
///
/// The Redis backend requires `redis_url`; without it construction fails
/// with `DomainError::ConfigurationError`.
pub async fn build_event_store(
    config: &EventTrackerConfig,
    clock: Arc<dyn Clock>,
) -> DomainResult<Arc<dyn EventStore>> {
    match config.store_backend {
        StoreBackendKind::Memory => {
            info!(
                cleanup_interval_ms = config.cleanup_interval_ms,
                "using in-memory event store"
            );
            Ok(Arc::new(InMemoryEventStore::with_cleanup(
                config.cleanup_interval(),
                clock,
            )))
        }
        StoreBackendKind::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                DomainError::ConfigurationError(
                    "redis_url is required for the redis store backend".to_string(),
                )
            })?;
            let client = RedisClient::connect(url).await?;
            let store = RedisEventStore::new(
                client,
                RedisEventStoreConfig {
                    key_prefix: config.redis_key_prefix.clone(),
                    index_key: config.redis_index_key.clone(),
                },
            )?;
            info!(key_prefix = %config.redis_key_prefix, "using redis event store");
            Ok(Arc::new(store))
        }
    }
}

/// Build the throttling strategy selected by `config.strategy`
pub fn build_strategy(config: &EventTrackerConfig) -> Arc<dyn ThrottleStrategy> {
    match config.strategy {
        StrategyKind::Counter => Arc::new(CounterStrategy::new()),
        StrategyKind::TokenBucket => {
            Arc::new(TokenBucketStrategy::new(config.bucket_size, config.refill_rate))
        }
    }
}
