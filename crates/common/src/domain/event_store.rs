use crate::domain::result::DomainResult;
use crate::domain::EventRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Keyed record storage with a secondary index over deferred records.
///
/// Implementations know nothing about throttling policy. Each call is atomic
/// on its own; a read followed by a write is not, so two callers racing on
/// the same key resolve last-write-wins.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Get the record stored under a composite key
    async fn get(&self, key: &str) -> DomainResult<Option<EventRecord>>;

    /// Insert or replace a record, keeping the deferred index in step with
    /// `record.deferred`
    async fn set(&self, key: &str, record: &EventRecord) -> DomainResult<()>;

    /// Remove a record and its deferred index entry
    async fn delete(&self, key: &str) -> DomainResult<()>;

    /// Approximate number of distinct record keys
    async fn size(&self) -> DomainResult<usize>;

    /// Deferred records whose scheduled send time is at or before `now`
    async fn find_due_deferred(&self, now: DateTime<Utc>) -> DomainResult<Vec<EventRecord>>;

    /// Every deferred record regardless of due time.
    ///
    /// `None` means the backend cannot list them; callers fall back to
    /// `find_due_deferred` with a far-future horizon.
    async fn find_all_deferred(&self) -> DomainResult<Option<Vec<EventRecord>>> {
        Ok(None)
    }

    /// Release background resources owned by the store
    async fn destroy(&self) -> DomainResult<()>;
}
