//! Convenient re-exports for common connguard types.
pub use crate::{
    checker::{Attempt, AttemptChecker, AuthOutcome},
    config::{LockConfig, ThrottleConfig},
    error::{LockError, StoreError, ThrottleError},
    layer::{AuthRequest, AuthStatus, GuardError, ThrottleLayer},
    lock::{FileLock, LocalLock, LockManager},
    paths::StorePaths,
    policy::Verdict,
    store::{FailureRecord, FileRecordStore, InMemoryRecordStore, RecordStore},
    telemetry::{LogSink, MemorySink, NullSink, ThrottleEvent},
};
