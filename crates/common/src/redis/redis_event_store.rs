use crate::domain::{DomainError, DomainResult, EventRecord, EventStore, RecordConfig};
use crate::garde::validate_config;
use crate::redis::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garde::Validate;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const SCAN_BATCH: usize = 500;

// KEYS[1] is the index, KEYS[i + 1] the hash behind member ARGV[i]. A member
// is only removed while its hash is still gone or not deferred, so a `set`
// that lands between the read and the prune keeps its index entry.
const PRUNE_INDEX_SCRIPT: &str = r"
local removed = 0
for i, member in ipairs(ARGV) do
  if redis.call('HGET', KEYS[i + 1], 'deferred') ~= '1' then
    removed = removed + redis.call('ZREM', KEYS[1], member)
  end
end
return removed
";

const FIELD_KEY: &str = "key";
const FIELD_CATEGORY: &str = "category";
const FIELD_IDENTIFIER: &str = "identifier";
const FIELD_DETAILS: &str = "details";
const FIELD_FINGERPRINT: &str = "details_fingerprint";
const FIELD_COUNT: &str = "count";
const FIELD_LAST_EVENT_TIME: &str = "last_event_time";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_DEFERRED: &str = "deferred";
const FIELD_SCHEDULED_SEND_AT: &str = "scheduled_send_at";
const FIELD_CONFIG: &str = "config";
const FIELD_STRATEGY_DATA: &str = "strategy_data";

/// Key layout for the Redis store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RedisEventStoreConfig {
    /// Prefix prepended to the composite key to form a record's hash key
    #[garde(length(min = 1))]
    pub key_prefix: String,

    /// Sorted set holding (score = scheduled_send_at ms, member = composite key)
    #[garde(length(min = 1))]
    pub index_key: String,
}

impl Default for RedisEventStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "event_tracker:record:".to_string(),
            index_key: "event_tracker:deferred".to_string(),
        }
    }
}

/// `EventStore` shared between processes through Redis.
///
/// Each record is a hash at `{key_prefix}{composite_key}` carrying a
/// `PEXPIREAT` equal to its `expires_at`, so stale records evict themselves.
/// Deferred records are also members of the `index_key` sorted set.
///
/// `set` and `delete` run as `MULTI`/`EXEC` pipelines, so a record is never
/// visible without its index entry or the other way round. The tracker's
/// read-decide-write sequence is not transactional: two processes tracking
/// the same key concurrently can both read the same record and the later
/// `set` wins.
#[derive(Clone)]
pub struct RedisEventStore {
    client: RedisClient,
    config: RedisEventStoreConfig,
}

impl RedisEventStore {
    pub fn new(client: RedisClient, config: RedisEventStoreConfig) -> DomainResult<Self> {
        validate_config(&config)?;
        if config.index_key.starts_with(&config.key_prefix) {
            return Err(DomainError::ConfigurationError(format!(
                "index key '{}' must live outside the record prefix '{}'",
                config.index_key, config.key_prefix
            )));
        }
        Ok(Self { client, config })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Remove index members whose record is gone or no longer deferred.
    ///
    /// The check runs server side, so members re-deferred by another writer
    /// since they were read are left alone. Returns how many were removed.
    pub async fn prune_index(&self, keys: &[String]) -> DomainResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let script = redis::Script::new(PRUNE_INDEX_SCRIPT);
        let mut invocation = script.key(&self.config.index_key);
        for key in keys {
            invocation.key(self.record_key(key)).arg(key);
        }

        let mut conn = self.client.connection();
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error)
    }

    /// Load the records behind a list of index members, skipping members whose
    /// hash has expired or been removed and pruning them from the index.
    async fn load_indexed(&self, keys: Vec<String>) -> DomainResult<Vec<EventRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(self.record_key(key));
        }

        let mut conn = self.client.connection();
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(storage_error)?;

        let mut records = Vec::with_capacity(keys.len());
        let mut stale = Vec::new();
        for (key, fields) in keys.into_iter().zip(rows) {
            if fields.is_empty() {
                stale.push(key);
                continue;
            }
            let record = record_from_fields(&key, &fields)?;
            if record.deferred {
                records.push(record);
            } else {
                stale.push(key);
            }
        }

        if !stale.is_empty() {
            match self.prune_index(&stale).await {
                Ok(removed) => debug!(
                    candidates = stale.len(),
                    removed, "dropped stale deferred index entries"
                ),
                Err(e) => warn!(error = %e, "failed to prune stale deferred index entries"),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn get(&self, key: &str) -> DomainResult<Option<EventRecord>> {
        let mut conn = self.client.connection();
        let fields: HashMap<String, String> = conn
            .hgetall(self.record_key(key))
            .await
            .map_err(storage_error)?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(key, &fields).map(Some)
    }

    async fn set(&self, key: &str, record: &EventRecord) -> DomainResult<()> {
        let record_key = self.record_key(key);
        let fields = record_to_fields(record)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&record_key).ignore();
        pipe.hset_multiple(&record_key, fields.as_slice()).ignore();
        pipe.cmd("PEXPIREAT")
            .arg(&record_key)
            .arg(record.expires_at.timestamp_millis())
            .ignore();
        match (record.deferred, record.scheduled_send_at) {
            (true, Some(at)) => {
                pipe.zadd(&self.config.index_key, key, at.timestamp_millis())
                    .ignore();
            }
            _ => {
                pipe.zrem(&self.config.index_key, key).ignore();
            }
        }

        let mut conn = self.client.connection();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.record_key(key)).ignore();
        pipe.zrem(&self.config.index_key, key).ignore();

        let mut conn = self.client.connection();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_error)?;
        Ok(())
    }

    async fn size(&self) -> DomainResult<usize> {
        let pattern = format!("{}*", self.config.key_prefix);
        let mut conn = self.client.connection();
        let mut cursor: u64 = 0;
        let mut count = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(storage_error)?;
            count += keys
                .iter()
                .filter(|k| k.as_str() != self.config.index_key)
                .count();
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(count)
    }

    async fn find_due_deferred(&self, now: DateTime<Utc>) -> DomainResult<Vec<EventRecord>> {
        let mut conn = self.client.connection();
        let keys: Vec<String> = conn
            .zrangebyscore(&self.config.index_key, "-inf", now.timestamp_millis())
            .await
            .map_err(storage_error)?;
        self.load_indexed(keys).await
    }

    async fn find_all_deferred(&self) -> DomainResult<Option<Vec<EventRecord>>> {
        let mut conn = self.client.connection();
        let keys: Vec<String> = conn
            .zrange(&self.config.index_key, 0, -1)
            .await
            .map_err(storage_error)?;
        self.load_indexed(keys).await.map(Some)
    }

    async fn destroy(&self) -> DomainResult<()> {
        // The connection belongs to whoever built the RedisClient
        Ok(())
    }
}

fn storage_error(err: redis::RedisError) -> DomainError {
    DomainError::StorageError(err.into())
}

fn encode_json<T: Serialize>(key: &str, value: &T) -> DomainResult<String> {
    serde_json::to_string(value)
        .map_err(|e| DomainError::SerializationError(key.to_string(), e.to_string()))
}

fn record_to_fields(record: &EventRecord) -> DomainResult<Vec<(&'static str, String)>> {
    Ok(vec![
        (FIELD_KEY, record.key.clone()),
        (FIELD_CATEGORY, record.category.clone()),
        (FIELD_IDENTIFIER, record.identifier.clone()),
        (FIELD_DETAILS, encode_json(&record.key, &record.details)?),
        (FIELD_FINGERPRINT, record.details_fingerprint.clone()),
        (FIELD_COUNT, record.count.to_string()),
        (
            FIELD_LAST_EVENT_TIME,
            record.last_event_time.timestamp_millis().to_string(),
        ),
        (FIELD_EXPIRES_AT, record.expires_at.timestamp_millis().to_string()),
        (FIELD_DEFERRED, if record.deferred { "1" } else { "0" }.to_string()),
        (
            FIELD_SCHEDULED_SEND_AT,
            record
                .scheduled_send_at
                .map(|at| at.timestamp_millis().to_string())
                .unwrap_or_default(),
        ),
        (FIELD_CONFIG, encode_json(&record.key, &record.config)?),
        (FIELD_STRATEGY_DATA, encode_json(&record.key, &record.strategy_data)?),
    ])
}

fn record_from_fields(key: &str, fields: &HashMap<String, String>) -> DomainResult<EventRecord> {
    let corrupt = |msg: String| DomainError::SerializationError(key.to_string(), msg);

    let get = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
    };
    let parse_json = |name: &str| -> DomainResult<serde_json::Value> {
        serde_json::from_str(get(name)?).map_err(|e| corrupt(format!("{}: {}", name, e)))
    };
    let parse_millis = |name: &str, raw: &str| -> DomainResult<DateTime<Utc>> {
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(format!("{}: invalid timestamp '{}'", name, raw)))
    };

    let config: RecordConfig = serde_json::from_str(get(FIELD_CONFIG)?)
        .map_err(|e| corrupt(format!("{}: {}", FIELD_CONFIG, e)))?;
    let count = get(FIELD_COUNT)?
        .parse::<u64>()
        .map_err(|e| corrupt(format!("{}: {}", FIELD_COUNT, e)))?;
    let scheduled_send_at = match get(FIELD_SCHEDULED_SEND_AT)? {
        "" => None,
        raw => Some(parse_millis(FIELD_SCHEDULED_SEND_AT, raw)?),
    };
    let deferred = get(FIELD_DEFERRED)? == "1";

    Ok(EventRecord {
        key: key.to_string(),
        category: get(FIELD_CATEGORY)?.to_string(),
        identifier: get(FIELD_IDENTIFIER)?.to_string(),
        details: parse_json(FIELD_DETAILS)?,
        details_fingerprint: get(FIELD_FINGERPRINT)?.to_string(),
        count,
        last_event_time: parse_millis(FIELD_LAST_EVENT_TIME, get(FIELD_LAST_EVENT_TIME)?)?,
        expires_at: parse_millis(FIELD_EXPIRES_AT, get(FIELD_EXPIRES_AT)?)?,
        deferred: deferred && scheduled_send_at.is_some(),
        scheduled_send_at,
        config,
        strategy_data: parse_json(FIELD_STRATEGY_DATA)?,
    })
}
