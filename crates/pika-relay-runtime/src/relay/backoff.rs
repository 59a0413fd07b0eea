//! Reconnect delay for one relay.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::BackoffConfig;

/// Doubling delay with multiplicative jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    until: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            until: None,
        }
    }

    /// Failures since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered delay for the current attempt
    pub fn base_delay(&self) -> Duration {
        let initial = self.config.initial.as_millis();
        let max = self.config.max.as_millis();
        let factor = 1u128.checked_shl(self.attempts.min(63)).unwrap_or(u128::MAX);
        let ms = initial.saturating_mul(factor).min(max);
        Duration::from_millis(ms.min(u64::MAX as u128) as u64)
    }

    /// Records a failure at `now` and opens the next window.
    pub fn fail(&mut self, now: Instant) -> Duration {
        let delay = self.jittered(self.base_delay());
        self.attempts = self.attempts.saturating_add(1);
        self.until = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.until = None;
    }

    /// Closes the current window without forgetting the attempt count.
    pub fn skip(&mut self) {
        self.until = None;
    }

    /// Time left in the window, if one is open at `now`
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn jittered(&self, base: Duration) -> Duration {
        let (lo, hi) = (self.config.jitter_min, self.config.jitter_max);
        let factor = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        base.mul_f64(factor.max(0.0)).min(self.config.max.mul_f64(hi.max(1.0)))
    }
}
