//! Retry policy

use std::time::Duration;

use gantry_core::config::RetryPolicyConfig;
use serde::Serialize;

use crate::error::{ExecError, Result};

/// How often and how patiently a command is retried.
///
/// Values are checked on construction and cannot change afterwards, so a
/// policy is fixed for the whole retry sequence that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    per_attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy, rejecting out-of-range values
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        per_attempt_timeout: Duration,
    ) -> Result<Self> {
        if max_attempts < 1 {
            return Err(ExecError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ExecError::InvalidPolicy(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                backoff_multiplier
            )));
        }
        if per_attempt_timeout.is_zero() {
            return Err(ExecError::InvalidPolicy(
                "per_attempt_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            per_attempt_timeout,
        })
    }

    /// A single attempt with the given timeout
    pub fn once(per_attempt_timeout: Duration) -> Result<Self> {
        Self::new(1, Duration::ZERO, 1.0, per_attempt_timeout)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    /// Delay to wait before `attempt` (1-based).
    ///
    /// No delay precedes the first attempt; attempt `i >= 2` waits
    /// `initial_delay * backoff_multiplier^(i - 2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl TryFrom<&RetryPolicyConfig> for RetryPolicy {
    type Error = ExecError;

    fn try_from(config: &RetryPolicyConfig) -> Result<Self> {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            config.backoff_multiplier,
            Duration::from_secs(config.per_attempt_timeout_secs),
        )
    }
}
