use crate::domain::{Clock, DomainResult, EventRecord, EventStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct StoreState {
    records: HashMap<String, EventRecord>,
    /// (scheduled_send_at, key) for every deferred record
    deferred_index: BTreeSet<(DateTime<Utc>, String)>,
}

impl StoreState {
    fn unindex(&mut self, key: &str) {
        if let Some(at) = self.records.get(key).and_then(|r| r.scheduled_send_at) {
            self.deferred_index.remove(&(at, key.to_string()));
        }
    }

    fn insert(&mut self, key: &str, record: EventRecord) {
        self.unindex(key);
        if record.deferred {
            if let Some(at) = record.scheduled_send_at {
                self.deferred_index.insert((at, key.to_string()));
            }
        }
        self.records.insert(key.to_string(), record);
    }

    fn remove(&mut self, key: &str) -> Option<EventRecord> {
        self.unindex(key);
        self.records.remove(key)
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// In-process `EventStore` backed by a `HashMap`.
///
/// Every call takes the lock once, so single operations are consistent, but
/// the tracker's read-decide-write sequence is not serialized: callers that
/// track the same key from several tasks at once get last-write-wins.
///
/// An optional background sweep drops records whose `expires_at` has passed.
/// The tracker already treats expired records as absent on read; the sweep
/// only bounds memory for keys that are never seen again.
pub struct InMemoryEventStore {
    state: Arc<RwLock<StoreState>>,
    sweep_token: CancellationToken,
}

impl InMemoryEventStore {
    /// Store without a background sweep
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            sweep_token: CancellationToken::new(),
        }
    }

    /// Store that sweeps expired records every `cleanup_interval`.
    ///
    /// A zero interval disables the sweep. Must be called from within a
    /// tokio runtime when the sweep is enabled.
    pub fn with_cleanup(cleanup_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let store = Self::new();
        if cleanup_interval.is_zero() {
            debug!("in-memory store cleanup disabled");
            return store;
        }

        let state = Arc::clone(&store.state);
        let token = store.sweep_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately on the first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("in-memory store cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = state.write().await.sweep_expired(clock.now());
                        if removed > 0 {
                            debug!(removed, "swept expired event records");
                        }
                    }
                }
            }
        });

        store
    }

    /// Drop every record that expired before `now`, returning how many went
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.state.write().await.sweep_expired(now)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryEventStore {
    fn drop(&mut self) {
        self.sweep_token.cancel();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get(&self, key: &str) -> DomainResult<Option<EventRecord>> {
        let state = self.state.read().await;
        Ok(state.records.get(key).cloned())
    }

    async fn set(&self, key: &str, record: &EventRecord) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state.remove(key);
        Ok(())
    }

    async fn size(&self) -> DomainResult<usize> {
        let state = self.state.read().await;
        Ok(state.records.len())
    }

    async fn find_due_deferred(&self, now: DateTime<Utc>) -> DomainResult<Vec<EventRecord>> {
        let state = self.state.read().await;
        Ok(state
            .deferred_index
            .iter()
            .take_while(|(at, _)| *at <= now)
            .filter_map(|(_, key)| state.records.get(key))
            .filter(|record| record.deferred)
            .cloned()
            .collect())
    }

    async fn find_all_deferred(&self) -> DomainResult<Option<Vec<EventRecord>>> {
        let state = self.state.read().await;
        Ok(Some(
            state
                .records
                .values()
                .filter(|record| record.deferred)
                .cloned()
                .collect(),
        ))
    }

    async fn destroy(&self) -> DomainResult<()> {
        self.sweep_token.cancel();
        Ok(())
    }
}
