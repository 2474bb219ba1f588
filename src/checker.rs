//! Attempt checker: the single entry point the host calls after verifying credentials.
//!
//! One check runs lock → read → decide → mutate → release. The lock is released on every path
//! once acquired. Any storage or lock failure is returned as an error and the host must refuse
//! the attempt.

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, SystemClock};
use crate::config::ThrottleConfig;
use crate::error::{StoreError, ThrottleError};
use crate::lock::{FileLock, LockManager};
use crate::paths::StorePaths;
use crate::policy::{self, Decision, EvictionReason, Mutation, Outcome, Verdict};
use crate::store::{FailureRecord, FileRecordStore, RecordStore};
use crate::telemetry::{emit_best_effort, NullSink, ThrottleEvent};
use std::sync::Arc;
use tower::Service;

/// Result of the host's credential verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure,
    /// Anything that is neither, e.g. an authentication plugin handing off to another round.
    /// Passed through without bookkeeping.
    Other,
}

/// One connection attempt as seen after credential verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub identity: String,
    pub ssl_active: bool,
    pub outcome: AuthOutcome,
}

impl Attempt {
    pub fn new(identity: impl Into<String>, ssl_active: bool, outcome: AuthOutcome) -> Self {
        Self { identity: identity.into(), ssl_active, outcome }
    }
}

struct Applied {
    decision: Decision,
    prior: Option<FailureRecord>,
}

/// Throttling engine over a record store and a lock manager.
///
/// # Example
///
/// ```rust
/// use connguard::{Attempt, AttemptChecker, AuthOutcome, InMemoryRecordStore, LocalLock};
/// use connguard::{ManualClock, ThrottleConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), connguard::ThrottleError> {
/// let checker = AttemptChecker::new(
///     InMemoryRecordStore::new(),
///     LocalLock::new(),
///     ThrottleConfig::new(1, 5),
/// )
/// .with_clock(ManualClock::starting_at(1_000));
///
/// let bad = Attempt::new("alice", false, AuthOutcome::Failure);
/// assert!(checker.check_attempt(&bad).await?.is_admit());
/// assert_eq!(checker.check_attempt(&bad).await?.retry_after_minutes(), Some(5));
/// # Ok(())
/// # }
/// ```
pub struct AttemptChecker<S, L, T = NullSink> {
    store: S,
    lock: L,
    config: DynamicConfig<ThrottleConfig>,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<S, L> AttemptChecker<S, L, NullSink>
where
    S: RecordStore,
    L: LockManager,
{
    pub fn new(store: S, lock: L, config: ThrottleConfig) -> Self {
        Self {
            store,
            lock,
            config: DynamicConfig::new(config),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl AttemptChecker<FileRecordStore, FileLock, NullSink> {
    /// Checker over the record file and lock marker named by `paths`, with default lock tuning.
    pub async fn file_backed(paths: StorePaths, config: ThrottleConfig) -> Result<Self, ThrottleError> {
        let lock = FileLock::new(&paths);
        let store = FileRecordStore::open(paths).await?;
        Ok(Self::new(store, lock, config))
    }
}

impl<S, L, T> AttemptChecker<S, L, T>
where
    S: RecordStore,
    L: LockManager,
    T: Service<ThrottleEvent, Response = ()> + Clone + Send + Sync + 'static,
    T::Error: std::error::Error + Send + 'static,
    T::Future: Send + 'static,
{
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Route events to `sink` instead of discarding them.
    pub fn with_sink<U>(self, sink: U) -> AttemptChecker<S, L, U>
    where
        U: Service<ThrottleEvent, Response = ()> + Clone + Send + Sync + 'static,
        U::Error: std::error::Error + Send + 'static,
        U::Future: Send + 'static,
    {
        AttemptChecker {
            store: self.store,
            lock: self.lock,
            config: self.config,
            clock: self.clock,
            sink,
        }
    }

    /// Share an existing reload handle, e.g. one owned by the host's configuration layer.
    pub fn with_config_handle(mut self, handle: DynamicConfig<ThrottleConfig>) -> Self {
        self.config = handle;
        self
    }

    /// Handle for replacing the configuration at runtime. Each check reads it once.
    pub fn config_handle(&self) -> DynamicConfig<ThrottleConfig> {
        self.config.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lock_manager(&self) -> &L {
        &self.lock
    }

    /// Decide whether the attempt may proceed and update the identity's failure record.
    ///
    /// A record over its threshold inside its window is denied and left untouched. Otherwise
    /// stale records are dropped first, then a failure is counted or a success clears the
    /// record. On `Err` the host must refuse the attempt; a
    /// [`ThrottleError::LockRelease`] still carries the verdict that was persisted.
    pub async fn check_attempt(&self, attempt: &Attempt) -> Result<Verdict, ThrottleError> {
        let outcome = match attempt.outcome {
            AuthOutcome::Success => Outcome::Success,
            AuthOutcome::Failure => Outcome::Failure,
            AuthOutcome::Other => {
                tracing::trace!(identity = %attempt.identity, "outcome carries no bookkeeping");
                self.emit(ThrottleEvent::Skipped { identity: attempt.identity.clone() }).await;
                return Ok(Verdict::Admit);
            }
        };
        if attempt.identity.is_empty() {
            return Err(StoreError::InvalidIdentity.into());
        }

        let config = self.config.get();
        let guard = self.lock.acquire().await?;
        let result = self.decide_and_apply(attempt, outcome, &config).await;
        let released = self.lock.release(guard).await;

        match (result, released) {
            (Ok(applied), Ok(())) => {
                self.report(&attempt.identity, &applied).await;
                Ok(applied.decision.verdict)
            }
            (Ok(applied), Err(source)) => {
                let verdict = applied.decision.verdict;
                tracing::error!(
                    identity = %attempt.identity,
                    %verdict,
                    error = %source,
                    "record store lock not released cleanly"
                );
                self.report(&attempt.identity, &applied).await;
                self.emit(ThrottleEvent::LockReleaseFailed { reason: source.to_string() }).await;
                Err(ThrottleError::LockRelease { verdict, source })
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                tracing::error!(error = %release, "record store lock not released after failed check");
                Err(e)
            }
        }
    }

    async fn decide_and_apply(
        &self,
        attempt: &Attempt,
        outcome: Outcome,
        config: &ThrottleConfig,
    ) -> Result<Applied, ThrottleError> {
        let identity = attempt.identity.as_str();
        let now = self.clock.now_secs();
        let prior = self.store.get(identity).await?;
        let decision =
            policy::decide(identity, prior.as_ref(), attempt.ssl_active, outcome, config, now);

        tracing::debug!(
            identity,
            ssl = attempt.ssl_active,
            ?outcome,
            verdict = %decision.verdict,
            failure_count = decision.resulting_count,
            "attempt decided"
        );

        match &decision.mutation {
            Mutation::Keep => {}
            Mutation::Remove => {
                self.store.remove(identity).await?;
            }
            Mutation::Insert(record) => self.store.insert(record).await?,
            Mutation::Increment { now } => {
                self.store.increment_and_refresh(identity, *now).await?;
            }
            Mutation::Replace(record) => {
                self.store.remove(identity).await?;
                self.store.insert(record).await?;
            }
        }

        Ok(Applied { decision, prior })
    }

    async fn report(&self, identity: &str, applied: &Applied) {
        let Applied { decision, prior } = applied;
        let prior_count = prior.as_ref().map_or(0, |r| r.failure_count());

        if let Some(reason) = decision.eviction {
            tracing::info!(identity, %reason, failure_count = prior_count, "dropped lapsed record");
            self.emit(ThrottleEvent::Evicted {
                identity: identity.to_string(),
                failure_count: prior_count,
                reason,
            })
            .await;
        }

        match (&decision.verdict, &decision.mutation) {
            (Verdict::Deny { retry_after_minutes }, _) => {
                tracing::warn!(
                    identity,
                    failure_count = decision.resulting_count,
                    retry_after_minutes,
                    "attempt refused"
                );
                self.emit(ThrottleEvent::Denied {
                    identity: identity.to_string(),
                    failure_count: decision.resulting_count,
                    retry_after_minutes: *retry_after_minutes,
                })
                .await;
            }
            (Verdict::Admit, Mutation::Insert(_) | Mutation::Replace(_) | Mutation::Increment { .. }) => {
                self.emit(ThrottleEvent::FailureRecorded {
                    identity: identity.to_string(),
                    failure_count: decision.resulting_count,
                })
                .await;
            }
            (Verdict::Admit, Mutation::Remove) if decision.eviction.is_none() => {
                tracing::info!(identity, failure_count = prior_count, "failures cleared");
                self.emit(ThrottleEvent::Cleared {
                    identity: identity.to_string(),
                    previous_count: prior_count,
                })
                .await;
            }
            _ => {}
        }
    }

    async fn emit(&self, event: ThrottleEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn release_after<R>(
        &self,
        guard: L::Guard,
        result: Result<R, ThrottleError>,
    ) -> Result<R, ThrottleError> {
        let released = self.lock.release(guard).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(release) = released {
                    tracing::error!(error = %release, "record store lock not released");
                }
                Err(e)
            }
        }
    }

    /// Every tracked identity, in storage order.
    pub async fn tracked(&self) -> Result<Vec<FailureRecord>, ThrottleError> {
        let guard = self.lock.acquire().await?;
        let result = self.store.load().await.map_err(ThrottleError::from);
        self.release_after(guard, result).await
    }

    /// Drop the identity's record regardless of its state. Returns whether one existed.
    pub async fn forgive(&self, identity: &str) -> Result<bool, ThrottleError> {
        let guard = self.lock.acquire().await?;
        let result = async {
            let prior = self.store.get(identity).await?;
            if prior.is_some() {
                self.store.remove(identity).await?;
            }
            Ok::<_, ThrottleError>(prior)
        }
        .await;
        let prior = self.release_after(guard, result).await?;

        match prior {
            Some(record) => {
                tracing::info!(identity, failure_count = record.failure_count(), "record forgiven");
                self.emit(ThrottleEvent::Cleared {
                    identity: identity.to_string(),
                    previous_count: record.failure_count(),
                })
                .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every record whose window has lapsed. Returns how many were removed.
    pub async fn purge_stale(&self) -> Result<usize, ThrottleError> {
        let config = self.config.get();
        let window = config.window_seconds();
        let threshold = config.refusal_threshold();

        let guard = self.lock.acquire().await?;
        let result = async {
            let now = self.clock.now_secs();
            let (stale, kept): (Vec<FailureRecord>, Vec<FailureRecord>) =
                self.store.load().await?.into_iter().partition(|r| r.age_secs(now) >= window);
            if !stale.is_empty() {
                self.store.rewrite(&kept).await?;
            }
            Ok::<_, ThrottleError>(stale)
        }
        .await;
        let stale = self.release_after(guard, result).await?;

        for record in &stale {
            let reason = if record.failure_count() >= threshold {
                EvictionReason::LockoutExpired
            } else {
                EvictionReason::StaleFailures
            };
            self.emit(ThrottleEvent::Evicted {
                identity: record.identity().to_string(),
                failure_count: record.failure_count(),
                reason,
            })
            .await;
        }
        if !stale.is_empty() {
            tracing::debug!(purged = stale.len(), "purged lapsed records");
        }
        Ok(stale.len())
    }
}

impl<S, L, T> std::fmt::Debug for AttemptChecker<S, L, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptChecker").field("config", &*self.config.get()).finish_non_exhaustive()
    }
}
