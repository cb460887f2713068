//! Exponential backoff with jitter for output delivery.
//!
//! The delay after failed attempt `n` (1-based) is
//!
//! ```text
//! min(max_delay, base_delay * backoff_multiplier^(n-1))
//! ```
//!
//! perturbed uniformly by up to `±jitter_factor` of that value. A jitter
//! factor of `0.0` yields deterministic delays.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Static retry policy a [`RetryState`] is created from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first send.
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay used as the jitter half-width.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let capped = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        Duration::from_secs_f64(capped.max(0.0) / 1000.0)
    }

    /// Delay after failed attempt `attempt`, with jitter applied.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = self.jitter_factor.min(1.0);
        let factor = 1.0 + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    RetryAfter(Duration),
    /// `max_attempts` reached; abandon the batch.
    GiveUp,
}

/// Per-batch retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    config: RetryConfig,
    attempts: u32,
    next_eligible_at: Option<Instant>,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
            next_eligible_at: None,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Earliest time the next attempt may be sent, if a retry is pending.
    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.next_eligible_at
    }

    /// Mark the start of a send attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_eligible_at = None;
        self.attempts
    }

    /// Record that the current attempt failed at `now`.
    pub fn record_failure<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> RetryDecision {
        if self.attempts >= self.config.max_attempts {
            self.next_eligible_at = None;
            return RetryDecision::GiveUp;
        }
        let delay = self.config.delay_for_attempt(self.attempts, rng);
        self.next_eligible_at = Some(now + delay);
        RetryDecision::RetryAfter(delay)
    }
}
