//! Tunables for the throttling policy and the lock manager.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the failure threshold.
pub const THRESHOLD_ENV: &str = "CONNGUARD_THRESHOLD";
/// Environment variable holding the lockout window in minutes.
pub const MINUTES_ENV: &str = "CONNGUARD_MINUTES";

/// Policy configuration: how many failures lock an identity out, and for how long.
///
/// Both values default to 0. A threshold of 0 means any tracked identity is refused while its
/// window is open; a window of 0 means every record is already stale when next consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    refusal_threshold: u32,
    refusal_window_minutes: u32,
}

impl ThrottleConfig {
    pub fn new(refusal_threshold: u32, refusal_window_minutes: u32) -> Self {
        Self { refusal_threshold, refusal_window_minutes }
    }

    /// Failures tolerated on an unencrypted channel before refusal.
    pub fn refusal_threshold(&self) -> u32 {
        self.refusal_threshold
    }

    /// Lockout window, as surfaced in the denial message.
    pub fn refusal_window_minutes(&self) -> u32 {
        self.refusal_window_minutes
    }

    pub fn window_seconds(&self) -> u64 {
        u64::from(self.refusal_window_minutes) * 60
    }

    /// Encrypted channels get double the allowance.
    pub fn effective_threshold(&self, ssl_active: bool) -> u32 {
        if ssl_active {
            self.refusal_threshold.saturating_mul(2)
        } else {
            self.refusal_threshold
        }
    }

    /// Parse a JSON object such as `{"refusal_threshold": 5, "refusal_window_minutes": 10}`.
    /// Missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read [`THRESHOLD_ENV`] and [`MINUTES_ENV`]; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let read = |var: &'static str| -> Result<u32, ConfigError> {
            match lookup(var) {
                None => Ok(0),
                Some(value) => value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::Env { var, value }),
            }
        };
        Ok(Self { refusal_threshold: read(THRESHOLD_ENV)?, refusal_window_minutes: read(MINUTES_ENV)? })
    }
}

/// Lock manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    poll_interval: Duration,
    poll_jitter: Duration,
    acquire_timeout: Option<Duration>,
    lease_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            poll_jitter: Duration::from_millis(1),
            acquire_timeout: Some(Duration::from_secs(10)),
            lease_ttl: Duration::from_secs(5),
        }
    }
}

impl LockConfig {
    /// Base wait between checks of a held marker.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Upper bound of the random extra wait added to each poll.
    pub fn poll_jitter(&self) -> Duration {
        self.poll_jitter
    }

    /// `None` waits forever.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    /// How long a lease stays valid; expired leases may be reclaimed by waiters.
    ///
    /// Leases are never renewed, so a waiter can only recover a crashed holder's marker if
    /// [`LockConfig::acquire_timeout`] is at least this long.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be > 0".into(),
            });
        }
        if self.lease_ttl < Duration::from_secs(1) {
            return Err(ConfigError::Invalid {
                field: "lease_ttl",
                reason: format!("must be at least 1s (got {:?})", self.lease_ttl),
            });
        }
        if !self.outlives_lease() {
            tracing::warn!(
                acquire_timeout = ?self.acquire_timeout,
                lease_ttl = ?self.lease_ttl,
                "acquire timeout is shorter than the lease; a crashed holder locks every attempt out until it expires"
            );
        }
        Ok(())
    }

    /// Whether a waiter can outlast an abandoned lease before timing out.
    pub fn outlives_lease(&self) -> bool {
        self.acquire_timeout.map_or(true, |timeout| timeout >= self.lease_ttl)
    }
}
