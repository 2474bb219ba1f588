//! Failure record storage.
//!
//! - [`FailureRecord`]: one tracked identity.
//! - [`RecordStore`]: the storage interface. Implementors provide whole-store `load`, `rewrite`
//!   and `append`; point operations are built on those, matching the full-scan/full-rewrite model
//!   of a small file-resident table.
//! - [`FileRecordStore`] and [`InMemoryRecordStore`] are the two backends.
//!
//! Every operation assumes the caller already holds the store lock.

use crate::error::StoreError;
use async_trait::async_trait;

pub mod codec;
pub mod file;
pub mod memory;

pub use file::FileRecordStore;
pub use memory::InMemoryRecordStore;

/// Failure state of one identity. Exists only while at least one failure is unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    identity: String,
    failure_count: u32,
    last_failure: u64,
}

impl FailureRecord {
    pub fn new(identity: impl Into<String>, failure_count: u32, last_failure: u64) -> Self {
        Self { identity: identity.into(), failure_count, last_failure }
    }

    /// Record created by an identity's first failed attempt.
    pub fn first_failure(identity: impl Into<String>, now: u64) -> Self {
        Self::new(identity, 1, now)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Epoch seconds of the most recent failure.
    pub fn last_failure(&self) -> u64 {
        self.last_failure
    }

    /// Seconds since the last failure; 0 if the timestamp is in the future.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_failure)
    }

    /// The record after one more failure at `now`.
    pub fn incremented(&self, now: u64) -> Self {
        Self::new(self.identity.clone(), self.failure_count.saturating_add(1), now)
    }
}

/// Storage interface for failure records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read every record. Unreadable lines are skipped by the backend.
    async fn load(&self) -> Result<Vec<FailureRecord>, StoreError>;

    /// Replace the whole store with `records`.
    async fn rewrite(&self, records: &[FailureRecord]) -> Result<(), StoreError>;

    /// Add a record without checking for an existing one.
    async fn append(&self, record: &FailureRecord) -> Result<(), StoreError>;

    async fn get(&self, identity: &str) -> Result<Option<FailureRecord>, StoreError> {
        Ok(self.load().await?.into_iter().find(|r| r.identity() == identity))
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.get(identity).await?.is_some())
    }

    /// The identity's failure count, or 0 if untracked.
    async fn failure_count(&self, identity: &str) -> Result<u32, StoreError> {
        Ok(self.get(identity).await?.map_or(0, |r| r.failure_count()))
    }

    /// Seconds since the identity's last failure. Untracked identities report `window_secs`, a
    /// value that is never "inside" the window.
    async fn seconds_since_last_failure(
        &self,
        identity: &str,
        now: u64,
        window_secs: u64,
    ) -> Result<u64, StoreError> {
        Ok(self.get(identity).await?.map_or(window_secs, |r| r.age_secs(now)))
    }

    /// Drop the identity's record. Returns whether one existed; an absent identity leaves the
    /// store untouched.
    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let records = self.load().await?;
        let before = records.len();
        let kept: Vec<FailureRecord> =
            records.into_iter().filter(|r| r.identity() != identity).collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.rewrite(&kept).await?;
        Ok(true)
    }

    /// Add a record for an untracked identity.
    async fn insert(&self, record: &FailureRecord) -> Result<(), StoreError> {
        if record.identity().is_empty() {
            return Err(StoreError::InvalidIdentity);
        }
        if self.exists(record.identity()).await? {
            return Err(StoreError::Duplicate { identity: record.identity().to_string() });
        }
        self.append(record).await
    }

    /// Remove then re-insert the identity with `count + 1` stamped at `now`. An untracked
    /// identity starts at 1.
    async fn increment_and_refresh(
        &self,
        identity: &str,
        now: u64,
    ) -> Result<FailureRecord, StoreError> {
        let next = match self.get(identity).await? {
            Some(current) => current.incremented(now),
            None => FailureRecord::first_failure(identity, now),
        };
        self.remove(identity).await?;
        self.insert(&next).await?;
        Ok(next)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rewrite(&[]).await
    }
}
