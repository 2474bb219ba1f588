#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # connguard
//!
//! Login-attempt throttling for authentication front-ends: track consecutive failed logins per
//! identity and refuse further attempts once a threshold is reached inside a lockout window.
//!
//! ## Components
//!
//! - **Lock manager** ([`lock`]): cross-process mutual exclusion through a lease-carrying marker
//!   file created atomically, with acquisition timeout and expired-lease reclaim.
//! - **Record store** ([`store`]): identity → failure state, persisted one escaped line per
//!   identity.
//! - **Policy engine** ([`policy`]): pure admit/deny state machine.
//! - **Attempt checker** ([`checker`]): lock → load → decide → mutate → release, fail-closed.
//! - **Host hook** ([`layer`]): tower middleware running the checker after credential
//!   verification.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use connguard::{AttemptChecker, Attempt, AuthOutcome, StorePaths, ThrottleConfig};
//!
//! # async fn run() -> Result<(), connguard::ThrottleError> {
//! let paths = StorePaths::in_dir("/var/lib/db");
//! let checker = AttemptChecker::file_backed(paths, ThrottleConfig::new(5, 10)).await?;
//!
//! let verdict = checker
//!     .check_attempt(&Attempt::new("alice", false, AuthOutcome::Failure))
//!     .await?;
//! if let Some(message) = verdict.denial_message() {
//!     eprintln!("{message}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod checker;
pub mod clock;
pub mod config;
pub mod error;
pub mod layer;
pub mod lock;
pub mod paths;
pub mod policy;
pub mod prelude;
pub mod sleeper;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use checker::{Attempt, AttemptChecker, AuthOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LockConfig, ThrottleConfig};
pub use error::{ConfigError, LockError, StoreError, ThrottleError};
pub use layer::{AuthRequest, AuthStatus, GuardError, ThrottleLayer, ThrottleService};
pub use lock::{FileLock, FileLockGuard, LocalLock, LockManager};
pub use paths::StorePaths;
pub use policy::{Decision, EvictionReason, Mutation, Outcome, Verdict};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{FailureRecord, FileRecordStore, InMemoryRecordStore, RecordStore};
