//! Backoff policy and the per-failure retry decision.

use std::time::Duration;

use rand::Rng;

/// How a failed attempt is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, 5xx, 429, connection reset.
    Transient,
    /// Delivered bytes did not match the declared digest.
    Integrity,
    /// Any other client error. Never retried.
    Fatal,
}

/// What to do with a chunk after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Re-queue the chunk once `delay` has elapsed.
    Retry(Duration),
    /// Mark the chunk (and its job) failed.
    GiveUp,
}

/// Exponential backoff with jitter and an attempt ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Backoff cap before jitter.
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay after attempt `attempt` (1-based): `base *
    /// 2^(attempt-1)` capped at `max_delay`, then spread by `± jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || capped == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + capped * jitter * offset).max(0.0))
    }

    /// Decides whether a chunk gets another attempt.
    ///
    /// `attempts` counts attempts made so far, including the one that just
    /// failed. `integrity_failures` counts integrity failures so far,
    /// including this one if it was one.
    pub fn decide(&self, kind: FailureKind, attempts: u32, integrity_failures: u32) -> RetryDecision {
        if kind == FailureKind::Fatal || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if kind == FailureKind::Integrity && integrity_failures > 1 {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempts))
    }
}
