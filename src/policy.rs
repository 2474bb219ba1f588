//! Admit/deny state machine.
//!
//! [`decide`] is a pure function of the current record, the channel, the attempt outcome, the
//! configuration and the current time. It never touches storage; the caller applies the returned
//! [`Mutation`] while still holding the store lock.
//!
//! # Transitions
//!
//! First an enforcement pass over the existing record (if any):
//!
//! | record | age | effect |
//! |---|---|---|
//! | count ≥ effective threshold | < window | **deny**, record untouched |
//! | count ≥ effective threshold | ≥ window | lockout expired, record dropped |
//! | count < effective threshold | ≥ window | stale failures, record dropped |
//! | count < effective threshold | < window | record kept |
//!
//! Then, unless denied, the outcome is applied: a failure inserts `count = 1` or increments the
//! kept record; a success drops the kept record. Both admit.
//!
//! Staleness is evaluated before the failure is counted, so a record whose window has lapsed
//! restarts at 1 rather than continuing its old count.

use crate::config::ThrottleConfig;
use crate::store::FailureRecord;
use serde::Serialize;
use std::fmt;

/// Outcome of the host's credential check that drives bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Engine verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Admit,
    /// Refuse the connection; the caller may retry after the configured window.
    Deny { retry_after_minutes: u32 },
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }

    pub fn retry_after_minutes(&self) -> Option<u32> {
        match self {
            Verdict::Deny { retry_after_minutes } => Some(*retry_after_minutes),
            Verdict::Admit => None,
        }
    }

    /// Message for the connecting party, present only on denial.
    pub fn denial_message(&self) -> Option<String> {
        self.retry_after_minutes().map(|minutes| {
            format!(
                "You are not allowed to access the database. Please try again after {} minutes.",
                minutes
            )
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Admit => write!(f, "admit"),
            Verdict::Deny { retry_after_minutes } => {
                write!(f, "deny(retry_after={}m)", retry_after_minutes)
            }
        }
    }
}

/// Why a record was dropped during the enforcement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// The identity had been locked out and the window has since elapsed.
    LockoutExpired,
    /// Below-threshold failures older than the window.
    StaleFailures,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::LockoutExpired => write!(f, "lockout_expired"),
            EvictionReason::StaleFailures => write!(f, "stale_failures"),
        }
    }
}

/// Store change the caller must apply for the decision to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Leave the store as it is.
    Keep,
    /// Delete the identity's record.
    Remove,
    /// The identity is untracked; add this record.
    Insert(FailureRecord),
    /// Remove then re-insert the tracked record with `count + 1` at the given time.
    Increment { now: u64 },
    /// A stale record was dropped and a fresh failure starts over with this record.
    Replace(FailureRecord),
}

/// Full result of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub mutation: Mutation,
    /// Set when the enforcement pass dropped the prior record.
    pub eviction: Option<EvictionReason>,
    /// Failure count stored for the identity once the mutation is applied (0 = untracked).
    pub resulting_count: u32,
}

/// Evaluate one attempt against the identity's current record.
///
/// `now` and the record timestamp are epoch seconds; a record stamped in the future counts as
/// age 0.
pub fn decide(
    identity: &str,
    record: Option<&FailureRecord>,
    ssl_active: bool,
    outcome: Outcome,
    config: &ThrottleConfig,
    now: u64,
) -> Decision {
    let threshold = config.effective_threshold(ssl_active);
    let window = config.window_seconds();

    let mut eviction = None;
    let mut tracked = record;

    if let Some(record) = record {
        let age = record.age_secs(now);
        let enforced = record.failure_count() >= threshold;

        match (enforced, age < window) {
            (true, true) => {
                return Decision {
                    verdict: Verdict::Deny { retry_after_minutes: config.refusal_window_minutes() },
                    mutation: Mutation::Keep,
                    eviction: None,
                    resulting_count: record.failure_count(),
                };
            }
            (true, false) => {
                eviction = Some(EvictionReason::LockoutExpired);
                tracked = None;
            }
            (false, false) => {
                eviction = Some(EvictionReason::StaleFailures);
                tracked = None;
            }
            (false, true) => {}
        }
    }

    let (mutation, resulting_count) = match (outcome, tracked) {
        (Outcome::Failure, Some(record)) => {
            (Mutation::Increment { now }, record.failure_count().saturating_add(1))
        }
        (Outcome::Failure, None) => {
            let fresh = FailureRecord::first_failure(identity, now);
            if eviction.is_some() {
                (Mutation::Replace(fresh), 1)
            } else {
                (Mutation::Insert(fresh), 1)
            }
        }
        (Outcome::Success, Some(_)) => (Mutation::Remove, 0),
        (Outcome::Success, None) if eviction.is_some() => (Mutation::Remove, 0),
        (Outcome::Success, None) => (Mutation::Keep, 0),
    };

    Decision { verdict: Verdict::Admit, mutation, eviction, resulting_count }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(count: u32, at: u64) -> FailureRecord {
        FailureRecord::new("alice", count, at)
    }

    #[test]
    fn untracked_failure_inserts_first_record() {
        let cfg = ThrottleConfig::new(3, 1);
        let d = decide("alice", None, false, Outcome::Failure, &cfg, 1_000);
        assert_eq!(d.verdict, Verdict::Admit);
        assert_eq!(d.mutation, Mutation::Insert(rec(1, 1_000)));
        assert_eq!(d.resulting_count, 1);
        assert!(d.eviction.is_none());
    }

    #[test]
    fn tracked_failure_increments() {
        let cfg = ThrottleConfig::new(3, 1);
        let d = decide("alice", Some(&rec(2, 990)), false, Outcome::Failure, &cfg, 1_000);
        assert_eq!(d.verdict, Verdict::Admit);
        assert_eq!(d.mutation, Mutation::Increment { now: 1_000 });
        assert_eq!(d.resulting_count, 3);
    }

    #[test]
    fn at_threshold_within_window_denies_without_mutation() {
        let cfg = ThrottleConfig::new(3, 1);
        for outcome in [Outcome::Failure, Outcome::Success] {
            let d = decide("alice", Some(&rec(3, 990)), false, outcome, &cfg, 1_000);
            assert_eq!(d.verdict, Verdict::Deny { retry_after_minutes: 1 });
            assert_eq!(d.mutation, Mutation::Keep);
            assert_eq!(d.resulting_count, 3);
        }
    }

    #[test]
    fn expired_lockout_resets_then_applies_outcome() {
        let cfg = ThrottleConfig::new(3, 1);
        let locked = rec(5, 1_000);

        let d = decide("alice", Some(&locked), false, Outcome::Failure, &cfg, 1_060);
        assert_eq!(d.verdict, Verdict::Admit);
        assert_eq!(d.mutation, Mutation::Replace(rec(1, 1_060)));
        assert_eq!(d.eviction, Some(EvictionReason::LockoutExpired));

        let d = decide("alice", Some(&locked), false, Outcome::Success, &cfg, 1_060);
        assert_eq!(d.mutation, Mutation::Remove);
        assert_eq!(d.resulting_count, 0);
    }

    #[test]
    fn stale_failures_evicted_before_counting() {
        let cfg = ThrottleConfig::new(3, 1);
        let d = decide("alice", Some(&rec(2, 1_000)), false, Outcome::Failure, &cfg, 1_060);
        assert_eq!(d.eviction, Some(EvictionReason::StaleFailures));
        assert_eq!(d.mutation, Mutation::Replace(rec(1, 1_060)));
        assert_eq!(d.resulting_count, 1);
    }

    #[test]
    fn success_clears_any_record() {
        let cfg = ThrottleConfig::new(3, 1);
        let d = decide("alice", Some(&rec(2, 999)), false, Outcome::Success, &cfg, 1_000);
        assert_eq!(d.mutation, Mutation::Remove);
        assert_eq!(d.verdict, Verdict::Admit);

        let d = decide("alice", None, false, Outcome::Success, &cfg, 1_000);
        assert_eq!(d.mutation, Mutation::Keep);
    }

    #[test]
    fn ssl_doubles_allowance() {
        let cfg = ThrottleConfig::new(3, 1);
        let existing = rec(3, 999);

        let plain = decide("alice", Some(&existing), false, Outcome::Failure, &cfg, 1_000);
        assert!(!plain.verdict.is_admit());

        let ssl = decide("alice", Some(&existing), true, Outcome::Failure, &cfg, 1_000);
        assert!(ssl.verdict.is_admit());
        assert_eq!(ssl.resulting_count, 4);

        let ssl = decide("alice", Some(&rec(6, 999)), true, Outcome::Failure, &cfg, 1_000);
        assert!(!ssl.verdict.is_admit());
    }

    #[test]
    fn zero_threshold_denies_any_tracked_identity() {
        let cfg = ThrottleConfig::new(0, 5);
        let first = decide("bob", None, false, Outcome::Failure, &cfg, 10);
        assert!(first.verdict.is_admit());
        assert_eq!(first.resulting_count, 1);

        let tracked = FailureRecord::new("bob", 1, 10);
        let second = decide("bob", Some(&tracked), false, Outcome::Success, &cfg, 11);
        assert_eq!(second.verdict, Verdict::Deny { retry_after_minutes: 5 });
    }

    #[test]
    fn zero_window_makes_every_record_stale() {
        let cfg = ThrottleConfig::new(1, 0);
        let d = decide("alice", Some(&rec(9, 1_000)), false, Outcome::Failure, &cfg, 1_000);
        assert!(d.verdict.is_admit());
        assert_eq!(d.eviction, Some(EvictionReason::LockoutExpired));
        assert_eq!(d.resulting_count, 1);
    }

    #[test]
    fn future_timestamps_count_as_fresh() {
        let cfg = ThrottleConfig::new(2, 1);
        let d = decide("alice", Some(&rec(2, 5_000)), false, Outcome::Failure, &cfg, 1_000);
        assert_eq!(d.verdict, Verdict::Deny { retry_after_minutes: 1 });
    }

    #[test]
    fn denial_message_mentions_minutes() {
        let msg = Verdict::Deny { retry_after_minutes: 7 }.denial_message().unwrap();
        assert!(msg.contains("7 minutes"));
        assert!(Verdict::Admit.denial_message().is_none());
        assert_eq!(Verdict::Deny { retry_after_minutes: 7 }.to_string(), "deny(retry_after=7m)");
    }
}
