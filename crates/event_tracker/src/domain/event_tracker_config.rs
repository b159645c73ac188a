use common::domain::{DomainError, DomainResult, RecordConfig};
use common::garde::validate_config;
use config::{Config, ConfigError, Environment};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which throttling strategy new trackers are built with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Counter,
    TokenBucket,
}

/// Which storage backend new trackers are built with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventTrackerConfig {
    /// Occurrences admitted per key before the counter strategy defers it (default: 5)
    #[serde(default = "default_limit")]
    #[garde(range(min = 1))]
    pub limit: u64,

    /// Delay before a deferred key becomes due, in milliseconds (default: 1 hour)
    #[serde(default = "default_defer_interval_ms")]
    #[garde(skip)]
    pub defer_interval_ms: u64,

    /// Idle window after which a record is treated as absent, in milliseconds (default: 24 hours)
    #[serde(default = "default_expire_time_ms")]
    #[garde(skip)]
    pub expire_time_ms: u64,

    /// Maximum distinct keys tracked at once, 0 for unlimited (default: 0)
    #[serde(default)]
    #[garde(skip)]
    pub max_keys: u64,

    /// Interval of the deferred event processor, in milliseconds (default: 10 seconds)
    #[serde(default = "default_processing_interval_ms")]
    #[garde(range(min = 1))]
    pub processing_interval_ms: u64,

    /// Interval of the in-memory expiry sweep, 0 disables it (default: 60 seconds)
    #[serde(default = "default_cleanup_interval_ms")]
    #[garde(skip)]
    pub cleanup_interval_ms: u64,

    #[serde(default)]
    #[garde(skip)]
    pub strategy: StrategyKind,

    /// Token bucket capacity (default: 10)
    #[serde(default = "default_bucket_size")]
    #[garde(range(min = 1))]
    pub bucket_size: u64,

    /// Token bucket refill rate in tokens per second (default: 1.0)
    #[serde(default = "default_refill_rate")]
    #[garde(custom(positive_rate))]
    pub refill_rate: f64,

    #[serde(default)]
    #[garde(skip)]
    pub store_backend: StoreBackendKind,

    /// Redis connection URL, required when `store_backend` is `redis`
    #[serde(default)]
    #[garde(skip)]
    pub redis_url: Option<String>,

    /// Prefix of the hash holding each record
    #[serde(default = "default_redis_key_prefix")]
    #[garde(length(min = 1))]
    pub redis_key_prefix: String,

    /// Sorted set indexing deferred records by due time
    #[serde(default = "default_redis_index_key")]
    #[garde(length(min = 1))]
    pub redis_index_key: String,
}

fn default_limit() -> u64 {
    5
}

fn default_defer_interval_ms() -> u64 {
    3_600_000
}

fn default_expire_time_ms() -> u64 {
    86_400_000
}

fn default_processing_interval_ms() -> u64 {
    10_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_bucket_size() -> u64 {
    10
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_redis_key_prefix() -> String {
    "event_tracker:record:".to_string()
}

fn default_redis_index_key() -> String {
    "event_tracker:deferred".to_string()
}

fn positive_rate(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() && *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new("must be a positive number"))
    }
}

impl Default for EventTrackerConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            defer_interval_ms: default_defer_interval_ms(),
            expire_time_ms: default_expire_time_ms(),
            max_keys: 0,
            processing_interval_ms: default_processing_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            strategy: StrategyKind::default(),
            bucket_size: default_bucket_size(),
            refill_rate: default_refill_rate(),
            store_backend: StoreBackendKind::default(),
            redis_url: None,
            redis_key_prefix: default_redis_key_prefix(),
            redis_index_key: default_redis_index_key(),
        }
    }
}

impl EventTrackerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("EVENT_TRACKER"))
            .build()?
            .try_deserialize()
    }

    /// Read from the environment and validate
    pub fn load() -> DomainResult<Self> {
        let config =
            Self::from_env().map_err(|e| DomainError::ConfigurationError(e.to_string()))?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Policy snapshot handed to strategies for new records
    pub fn record_defaults(&self) -> RecordConfig {
        RecordConfig {
            limit: self.limit,
            defer_interval_ms: self.defer_interval_ms,
            expire_time_ms: self.expire_time_ms,
            bucket_size: None,
            refill_rate: None,
        }
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "EVENT_TRACKER_LIMIT",
        "EVENT_TRACKER_STRATEGY",
        "EVENT_TRACKER_REFILL_RATE",
        "EVENT_TRACKER_STORE_BACKEND",
        "EVENT_TRACKER_REDIS_URL",
        "EVENT_TRACKER_MAX_KEYS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = EventTrackerConfig::from_env().unwrap();

        assert_eq!(config.limit, 5);
        assert_eq!(config.defer_interval_ms, 3_600_000);
        assert_eq!(config.expire_time_ms, 86_400_000);
        assert_eq!(config.max_keys, 0);
        assert_eq!(config.processing_interval(), Duration::from_secs(10));
        assert_eq!(config.strategy, StrategyKind::Counter);
        assert_eq!(config.store_backend, StoreBackendKind::Memory);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("EVENT_TRACKER_LIMIT", "3");
            std::env::set_var("EVENT_TRACKER_STRATEGY", "token_bucket");
            std::env::set_var("EVENT_TRACKER_REFILL_RATE", "2.5");
            std::env::set_var("EVENT_TRACKER_STORE_BACKEND", "redis");
            std::env::set_var("EVENT_TRACKER_REDIS_URL", "redis://localhost:6379");
            std::env::set_var("EVENT_TRACKER_MAX_KEYS", "100");
        }

        let config = EventTrackerConfig::load().unwrap();

        assert_eq!(config.limit, 3);
        assert_eq!(config.strategy, StrategyKind::TokenBucket);
        assert_eq!(config.refill_rate, 2.5);
        assert_eq!(config.store_backend, StoreBackendKind::Redis);
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.max_keys, 100);

        clear_env();
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("EVENT_TRACKER_LIMIT", "0");
        }

        let result = EventTrackerConfig::load();
        assert!(
            matches!(result, Err(DomainError::ConfigurationError(msg)) if msg.contains("limit"))
        );

        clear_env();
    }

    #[test]
    fn test_validation_rejects_non_positive_refill_rate() {
        let config = EventTrackerConfig {
            refill_rate: 0.0,
            ..Default::default()
        };

        let result = validate_config(&config);

        assert!(matches!(
            result,
            Err(DomainError::ConfigurationError(msg)) if msg.contains("refill_rate")
        ));
    }

    #[test]
    fn test_record_defaults_leave_bucket_parameters_to_strategy() {
        let config = EventTrackerConfig {
            limit: 7,
            ..Default::default()
        };

        let defaults = config.record_defaults();

        assert_eq!(defaults.limit, 7);
        assert_eq!(defaults.expire_time_ms, 86_400_000);
        assert!(defaults.bucket_size.is_none());
        assert!(defaults.refill_rate.is_none());
    }
}
