//! Per-dependency resilience configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker and retry settings for one external dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a trial call (milliseconds).
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Additional attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff delay before the first retry (milliseconds).
    #[serde(default = "default_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on the backoff delay (milliseconds).
    #[serde(default = "default_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Uniform jitter added to each delay, as a fraction (0.2 = up to +20%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    10_000 // 10 seconds
}

fn default_jitter() -> f64 {
    0.2
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_base_delay(),
            retry_max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl DependencyConfig {
    /// Breaker settings derived from this config.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
        }
    }

    /// Retry policy derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.jitter,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Sets the breaker threshold and cooldown.
    pub fn with_breaker(mut self, failure_threshold: u32, recovery_timeout_ms: u64) -> Self {
        self.failure_threshold = failure_threshold;
        self.recovery_timeout_ms = recovery_timeout_ms;
        self
    }

    /// Sets the retry count and backoff bounds.
    pub fn with_retries(mut self, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        DependencyConfig::default().breaker_config()
    }
}

/// Retry settings for a call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DependencyConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Nominal delay before retry number `attempt + 1`:
    /// `min(base_delay * 2^attempt, max_delay)`, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Range a jittered delay for `attempt` falls in.
    ///
    /// Jitter only ever lengthens the wait; the lower bound is the nominal
    /// backoff.
    pub fn jitter_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.backoff_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        (nominal, nominal.mul_f64(1.0 + jitter))
    }
}
