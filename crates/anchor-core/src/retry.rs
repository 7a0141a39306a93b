//! Retry policy for the resilient call path.
//!
//! Only error kinds listed in `retryable_errors` are retried. The default
//! set is exactly `{NotActive}`: a standby rejecting an exclusive call is
//! the one failure that a later attempt is expected to fix.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::types::ErrorKind;

/// Immutable backoff parameters for one call or one client default.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Multiplicative jitter range, `0.0..=1.0`.
    pub jitter_factor: f64,
    pub retryable_errors: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
            retryable_errors: HashSet::from([ErrorKind::NotActive]),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_errors = kinds.into_iter().collect();
        self
    }

    /// Reject parameter combinations that make the backoff meaningless.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::RetryPolicy(format!(
                "jitter_factor {} outside [0, 1]",
                self.jitter_factor
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::RetryPolicy(format!(
                "backoff_multiplier {} must be >= 1.0",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::RetryPolicy(format!(
                "initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Whether an error of `kind` may be retried under this policy.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_errors.contains(&kind)
    }

    /// Un-jittered delay before retry number `attempt` (0-based):
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        let cap = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    /// Jittered delay before retry number `attempt`.
    ///
    /// `sample` is a uniform draw from `[-1.0, 1.0]`; the base delay is scaled
    /// by `1 + sample * jitter_factor`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_nanos() as f64;
        let scale = (1.0 + sample.clamp(-1.0, 1.0) * self.jitter_factor).max(0.0);
        Duration::from_nanos((base * scale).round() as u64)
    }
}
