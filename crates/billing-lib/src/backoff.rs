//! Exponential reconnect backoff with jitter

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for the delay, jitter included
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

/// Tracks consecutive failures and hands out the next delay
///
/// There is no attempt limit: callers retry for as long as they run.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let base = self.current.min(self.config.max);
        self.current = std::cmp::min(self.current.saturating_mul(2), self.config.max);

        // Up to 25% jitter, never beyond the cap
        let jitter_ms = rand_jitter((base.as_millis() / 4) as u64);
        std::cmp::min(base + Duration::from_millis(jitter_ms), self.config.max)
    }

    /// Forget past failures after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Pseudo-random value in `0..max_ms`, seeded from the clock
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}
