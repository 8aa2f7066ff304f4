//! Exponential backoff between connection attempts.
//!
//! The remote service rate-limits session establishment aggressively enough
//! that reconnecting too eagerly can get a token flagged, so every connection
//! attempt consults this policy first, including the very first one.

use {
    serde::{Deserialize, Serialize},
    std::time::Duration,
    tokio::time::Instant,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base: u32,
    pub max_exponent: u32,
    pub coefficient: u32,
    pub min_backoff_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: 2,
            max_exponent: 7,
            coefficient: 1,
            min_backoff_ms: 15_000,
        }
    }
}

/// Attempt counter plus the timestamp of the last attempt. Mutated only by
/// the policy itself; reset on every successful connection and on explicit
/// disconnect.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_attempt: None,
        }
    }

    /// Delay for a given attempt count:
    /// `base^min(attempt, max_exponent) * coefficient`, floored at the
    /// configured minimum. Non-decreasing in `attempt` up to the exponent cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.config.max_exponent);
        let raw = u64::from(self.config.base)
            .saturating_pow(exponent)
            .saturating_mul(u64::from(self.config.coefficient))
            .saturating_mul(1_000);
        Duration::from_millis(raw.max(self.config.min_backoff_ms))
    }

    /// Remaining wait if the current attempt's delay window has not elapsed
    /// since the last recorded attempt, else `None`.
    pub fn can_proceed_in(&self) -> Option<Duration> {
        let last = self.last_attempt?;
        let window = self.delay_for(self.attempts);
        window.checked_sub(last.elapsed()).filter(|d| !d.is_zero())
    }

    /// Marks an attempt as spent. Called when the identify (or equivalent
    /// session-establishing payload) is actually sent, not merely scheduled.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
