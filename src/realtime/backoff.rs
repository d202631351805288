//! Reconnection backoff policy
//!
//! Exponential delay with a cap and additive jitter. The policy is plain
//! data: computing a delay has no side effects beyond drawing from the
//! supplied random source.

use rand::Rng;
use std::time::Duration;

/// Static reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub cap_delay: Duration,
    /// Jitter added on top of the delay, as a fraction of it
    pub jitter_fraction: f64,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            cap_delay: Duration::from_millis(30_000),
            jitter_fraction: 0.1,
            max_attempts: 10,
        }
    }
}

/// Delay to wait before attempt number `attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub delay: Duration,
    pub attempt: u32,
}

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed(BackoffDecision),
    AbortMaxAttemptsExceeded,
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("reconnect.max_attempts must be at least 1".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("reconnect.base_delay_ms must be greater than 0".to_string());
        }
        if self.cap_delay < self.base_delay {
            return Err(format!(
                "reconnect.cap_delay_ms ({}) must not be below base_delay_ms ({})",
                self.cap_delay.as_millis(),
                self.base_delay.as_millis()
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "reconnect.jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        Ok(())
    }

    /// `min(base * 2^(attempt-1), cap)` with no jitter
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.cap_delay, |delay| delay.min(self.cap_delay))
    }

    /// Jittered delay before retry number `attempt`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay drawing from an explicit random source
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.capped_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let factor: f64 = rng.gen();
        delay + delay.mul_f64(self.jitter_fraction * factor)
    }

    /// Backoff for a given retry number, ignoring the ceiling
    pub fn decision_for(&self, attempt: u32) -> BackoffDecision {
        BackoffDecision {
            delay: self.next_delay(attempt),
            attempt,
        }
    }

    /// Decide what follows `failed_attempts` consecutive failures
    pub fn after_failures(&self, failed_attempts: u32) -> ReconnectionDecision {
        if failed_attempts >= self.max_attempts {
            ReconnectionDecision::AbortMaxAttemptsExceeded
        } else {
            ReconnectionDecision::Proceed(self.decision_for(failed_attempts))
        }
    }
}
