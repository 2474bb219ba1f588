//! Mutual exclusion over the record store.
//!
//! Attempts may run in separate processes with no shared memory, so exclusion lives in the
//! filesystem next to the record file. [`FileLock`] creates its marker with `create_new`, which
//! is atomic: of any number of concurrent creators exactly one succeeds. The marker carries a
//! lease (owner id, pid, expiry); a holder that dies without releasing leaves a lease that any
//! waiter may reclaim once it has expired.
//!
//! Waiting is a poll loop (interval plus random jitter) through an injected [`Sleeper`] and is
//! bounded by [`LockConfig::acquire_timeout`]. The loop does its filesystem work through
//! `tokio::fs`. Release stays synchronous because it also runs from the guard's `Drop`.

use crate::clock::{Clock, SystemClock};
use crate::config::LockConfig;
use crate::error::{ConfigError, LockError};
use crate::paths::StorePaths;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

/// Exclusive access to the record store for the duration of one check.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Proof of exclusive access; hand it back to [`LockManager::release`].
    type Guard: Send;

    /// Wait until this caller holds the lock.
    async fn acquire(&self) -> Result<Self::Guard, LockError>;

    /// Give the lock up. Failing to do so cleanly is reported, not retried.
    async fn release(&self, guard: Self::Guard) -> Result<(), LockError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    owner: String,
    pid: u32,
    acquired_at: u64,
    expires_at: u64,
}

fn read_marker(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn read_marker_async(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Lease-carrying marker file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl FileLock {
    /// Lock over the marker named in `paths`, with default tuning.
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            path: paths.lock_file().to_path_buf(),
            config: LockConfig::default(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_config(mut self, config: LockConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Override the clock used for lease stamps and expiry (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Whether some marker currently exists.
    pub fn is_held(&self) -> Result<bool, LockError> {
        read_marker(&self.path)
            .map(|marker| marker.is_some())
            .map_err(|e| LockError::io(&self.path, e))
    }

    /// One create attempt. `Ok(None)` means someone else holds the marker.
    pub async fn try_lock(&self) -> Result<Option<FileLockGuard>, LockError> {
        let now = self.clock.now_secs();
        let lease = Lease {
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now.saturating_add(self.config.lease_ttl().as_secs()),
        };

        let opened =
            tokio::fs::OpenOptions::new().write(true).create_new(true).open(&self.path).await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(LockError::io(&self.path, e)),
        };
        let guard = FileLockGuard { path: self.path.clone(), owner: lease.owner.clone(), released: false };

        let body = serde_json::to_vec(&lease)
            .map_err(|e| LockError::io(&self.path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        // On a failed write the guard's drop removes the half-made marker.
        file.write_all(&body).await.map_err(|e| LockError::io(&self.path, e))?;
        file.flush().await.map_err(|e| LockError::io(&self.path, e))?;
        drop(file);

        tracing::trace!(path = %self.path.display(), owner = %lease.owner, "lock acquired");
        Ok(Some(guard))
    }

    /// Wait for the marker, reclaiming expired leases, until the acquisition timeout.
    pub async fn lock(&self) -> Result<FileLockGuard, LockError> {
        let start = Instant::now();
        let mut polls: u64 = 0;

        loop {
            if let Some(guard) = self.try_lock().await? {
                if polls > 0 {
                    tracing::debug!(polls, waited = ?start.elapsed(), "lock acquired after waiting");
                }
                return Ok(guard);
            }
            if self.reclaim_if_expired().await? {
                continue;
            }
            if let Some(limit) = self.config.acquire_timeout() {
                let waited = start.elapsed();
                if waited >= limit {
                    tracing::error!(path = %self.path.display(), ?waited, polls, "timed out waiting for lock");
                    return Err(LockError::Timeout { waited });
                }
            }
            polls += 1;
            self.sleeper.sleep(self.next_delay()).await;
        }
    }

    fn next_delay(&self) -> Duration {
        let interval = self.config.poll_interval();
        let jitter_nanos = u64::try_from(self.config.poll_jitter().as_nanos()).unwrap_or(u64::MAX);
        if jitter_nanos == 0 {
            return interval;
        }
        interval + Duration::from_nanos(rand::random::<u64>() % jitter_nanos.saturating_add(1))
    }

    async fn marker_expired(&self, observed: &[u8], now: u64) -> Result<bool, LockError> {
        if let Ok(lease) = serde_json::from_slice::<Lease>(observed) {
            return Ok(now >= lease.expires_at);
        }
        // Unparseable: a zero-byte marker from an older writer, or one caught between create
        // and write. Judge it by age.
        let modified = match tokio::fs::metadata(&self.path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            // Released since we read it; the caller re-reads before deleting anything.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(LockError::io(&self.path, e)),
        };
        let modified_secs = modified.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        Ok(now.saturating_sub(modified_secs) >= self.config.lease_ttl().as_secs())
    }

    /// Delete the marker if its lease has expired and it is unchanged since inspected.
    /// Returns `true` when the caller should retry the create immediately.
    async fn reclaim_if_expired(&self) -> Result<bool, LockError> {
        let io_err = |e| LockError::io(&self.path, e);

        let Some(observed) = read_marker_async(&self.path).await.map_err(io_err)? else {
            return Ok(true);
        };
        let now = self.clock.now_secs();
        if !self.marker_expired(&observed, now).await? {
            return Ok(false);
        }

        match read_marker_async(&self.path).await.map_err(io_err)? {
            None => Ok(true),
            Some(current) if current == observed => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(e)),
                }
                tracing::warn!(
                    path = %self.path.display(),
                    lease = %String::from_utf8_lossy(&observed),
                    "reclaimed expired lock lease"
                );
                Ok(true)
            }
            Some(_) => {
                tracing::debug!(path = %self.path.display(), "lease replaced while inspected; not reclaiming");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl LockManager for FileLock {
    type Guard = FileLockGuard;

    async fn acquire(&self) -> Result<FileLockGuard, LockError> {
        self.lock().await
    }

    async fn release(&self, guard: FileLockGuard) -> Result<(), LockError> {
        guard.release()
    }
}

/// Held [`FileLock`] marker. Removed on [`FileLockGuard::release`], or on drop if never
/// released explicitly.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl FileLockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Remove the marker, provided it is still ours.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_marker()
    }

    fn release_marker(&mut self) -> Result<(), LockError> {
        self.released = true;
        let current = read_marker(&self.path)
            .map_err(|e| LockError::io(&self.path, e))?
            .ok_or_else(|| LockError::Missing { path: self.path.clone() })?;

        match serde_json::from_slice::<Lease>(&current) {
            Ok(lease) if lease.owner == self.owner => {}
            Ok(lease) => return Err(LockError::Stolen { path: self.path.clone(), owner: lease.owner }),
            // Still ours if the write never landed; otherwise someone replaced it.
            Err(_) if current.is_empty() => {}
            Err(_) => {
                return Err(LockError::Stolen { path: self.path.clone(), owner: "unknown".into() })
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), owner = %self.owner, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(LockError::Missing { path: self.path.clone() })
            }
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.release_marker() {
            Ok(()) => tracing::warn!(path = %self.path.display(), "lock released on drop"),
            Err(e) => tracing::error!(error = %e, "failed to release lock on drop"),
        }
    }
}

/// In-process lock for hosts that run every attempt inside one process.
#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    mutex: Arc<tokio::sync::Mutex<()>>,
    acquire_timeout: Option<Duration>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[async_trait]
impl LockManager for LocalLock {
    type Guard = tokio::sync::OwnedMutexGuard<()>;

    async fn acquire(&self) -> Result<Self::Guard, LockError> {
        let pending = self.mutex.clone().lock_owned();
        match self.acquire_timeout {
            None => Ok(pending.await),
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| LockError::Timeout { waited: limit }),
        }
    }

    async fn release(&self, guard: Self::Guard) -> Result<(), LockError> {
        drop(guard);
        Ok(())
    }
}
