//! Bounded retry for transient backend failures.
//!
//! Only errors whose [`BackendErrorKind`] is in the policy's retryable set are
//! retried; everything else propagates on the first failure so real problems
//! are never masked as flakiness. Backoff doubles per attempt from
//! `base_interval` and is capped at `max_interval`.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use super::types::{BackendErrorKind, StatsError, StatsResult};

/// Retry/backoff configuration for statistic evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Max attempts per evaluation (including the first try).
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_interval: Duration,
    /// Maximum backoff delay.
    pub max_interval: Duration,
    /// Error kinds worth another attempt.
    pub retryable: HashSet<BackendErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            retryable: HashSet::from([BackendErrorKind::Serialization]),
        }
    }
}

impl RetryPolicy {
    /// Load retry config from env if present; fall back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `MSTAT_RETRY_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = dotenvy::var("MSTAT_RETRY_MAX")
            && let Ok(parsed) = val.parse::<u32>()
        {
            self.max_attempts = parsed.max(1);
        }
        if let Ok(val) = dotenvy::var("MSTAT_RETRY_BASE_MS")
            && let Ok(parsed) = val.parse::<u64>()
        {
            self.base_interval = Duration::from_millis(parsed);
        }
        if let Ok(val) = dotenvy::var("MSTAT_RETRY_MAX_MS")
            && let Ok(parsed) = val.parse::<u64>()
        {
            self.max_interval = Duration::from_millis(parsed.max(1));
        }
        self
    }

    /// Replace the retryable kind set.
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = BackendErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, err: &StatsError) -> bool {
        err.backend_kind()
            .is_some_and(|kind| self.retryable.contains(&kind))
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// Non-decreasing in `attempt` and never above `max_interval`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .base_interval
            .checked_mul(exp)
            .unwrap_or(self.max_interval);
        base.min(self.max_interval)
    }

    /// Run `op`, retrying classified transient failures.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// once attempts are exhausted.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut(u32) -> StatsResult<T>,
    ) -> StatsResult<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = self.is_retryable(&err);
                    let will_retry = retryable && attempt < max_attempts;
                    let backoff = if will_retry {
                        self.backoff_for_attempt(attempt)
                    } else {
                        Duration::ZERO
                    };
                    debug!(
                        statistic = label,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        backoff = ?backoff,
                        will_retry = will_retry,
                        error = %err,
                        "Statistic evaluation failed"
                    );
                    if !will_retry {
                        if retryable {
                            warn!(
                                statistic = label,
                                attempts = attempt,
                                error = %err,
                                "Giving up after transient backend failures"
                            );
                        }
                        return Err(err);
                    }
                    std::thread::sleep(backoff);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
