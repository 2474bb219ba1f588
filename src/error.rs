//! Error types for the throttling engine.
//!
//! Every error that reaches the host through [`ThrottleError`] means the check could not be
//! completed safely; the host must refuse the attempt rather than admit it.

use crate::policy::Verdict;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Record store failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The record file could not be opened, read, created or written.
    #[error("record store unavailable at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// An insert would create a second record for the identity.
    #[error("record for {identity:?} already exists")]
    Duplicate { identity: String },
    /// The identity cannot be stored (empty identities are reserved by the legacy line format).
    #[error("identity must not be empty")]
    InvalidIdentity,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }
}

/// Lock manager failures.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// The lock marker could not be created, read or removed.
    #[error("lock marker unavailable at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The marker stayed held by someone else past the acquisition timeout.
    #[error("timed out after {waited:?} waiting for the record store lock")]
    Timeout { waited: Duration },
    /// The marker was already gone when we went to release it.
    #[error("lock marker {} was missing at release", .path.display())]
    Missing { path: PathBuf },
    /// Our lease expired and another waiter reclaimed the marker.
    #[error("lock marker {} is now held by {owner}", .path.display())]
    Stolen { path: PathBuf, owner: String },
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LockError::Io { path: path.into(), source }
    }

    /// True for the two release-time failures (marker absent or no longer ours).
    pub fn is_release_failure(&self) -> bool {
        matches!(self, LockError::Missing { .. } | LockError::Stolen { .. })
    }
}

/// Configuration loading and validation failures.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {var} has non-integer value {value:?}")]
    Env { var: &'static str, value: String },
}

/// Failure of a single attempt check. Always fail-closed.
#[derive(thiserror::Error, Debug)]
pub enum ThrottleError {
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error("lock: {0}")]
    Lock(#[from] LockError),
    /// The decision was taken and persisted, but the lock marker could not be released.
    #[error("releasing lock after {verdict:?} verdict: {source}")]
    LockRelease {
        verdict: Verdict,
        #[source]
        source: LockError,
    },
}

impl ThrottleError {
    /// The verdict that had already been decided when the error occurred, if any.
    pub fn decided_verdict(&self) -> Option<&Verdict> {
        match self {
            ThrottleError::LockRelease { verdict, .. } => Some(verdict),
            _ => None,
        }
    }

    /// True if the store or lock medium itself was unreachable.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            ThrottleError::Store(StoreError::Io { .. }) | ThrottleError::Lock(LockError::Io { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn store_io_display_names_path() {
        let err = StoreError::io(
            "/data/connection_control",
            io::Error::new(io::ErrorKind::Other, "disk gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/connection_control"));
        assert!(msg.contains("disk gone"));
        assert!(err.source().is_some());
    }

    #[test]
    fn release_failures_are_classified() {
        assert!(LockError::Missing { path: "/x.lock".into() }.is_release_failure());
        assert!(LockError::Stolen { path: "/x.lock".into(), owner: "b".into() }
            .is_release_failure());
        assert!(!LockError::Timeout { waited: Duration::from_secs(1) }.is_release_failure());
    }

    #[test]
    fn lock_release_carries_verdict() {
        let err = ThrottleError::LockRelease {
            verdict: Verdict::Deny { retry_after_minutes: 4 },
            source: LockError::Missing { path: "/x.lock".into() },
        };
        assert_eq!(err.decided_verdict(), Some(&Verdict::Deny { retry_after_minutes: 4 }));
        assert!(!err.is_storage_unavailable());
        assert!(err.source().is_some());
    }

    #[test]
    fn storage_unavailable_predicate() {
        let err: ThrottleError =
            StoreError::io("/nope", io::Error::from(io::ErrorKind::PermissionDenied)).into();
        assert!(err.is_storage_unavailable());
        assert!(err.decided_verdict().is_none());

        let err: ThrottleError = LockError::Timeout { waited: Duration::from_millis(5) }.into();
        assert!(!err.is_storage_unavailable());
    }
}
