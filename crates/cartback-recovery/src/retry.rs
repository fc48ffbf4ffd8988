//! Backoff policy for verifier outages.
//!
//! A verification action that could not get an answer is put back in the
//! queue with an exponentially growing delay. Once the attempt budget is
//! spent the action fails and the lead stays `initiated`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;

/// Exponential backoff settings for verification retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRetryPolicy {
    /// Maximum verification attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction in `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for VerificationRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.1,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `next_attempt_at`.
    Retry {
        /// When the action should fire again
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl VerificationRetryPolicy {
    /// Policy with jitter disabled, for deterministic schedules.
    pub fn without_jitter(self) -> Self {
        Self { jitter_factor: 0.0, ..self }
    }

    /// Decides what to do after attempt `attempt` (1-based) failed with
    /// `error` at `failed_at`.
    pub fn decide(
        &self,
        attempt: u32,
        error: &RecoveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded: {error}", self.max_attempts),
            };
        }

        let next_attempt_at = chrono::Duration::from_std(self.delay_for(attempt))
            .ok()
            .and_then(|delay| failed_at.checked_add_signed(delay));

        match next_attempt_at {
            Some(next_attempt_at) => RetryDecision::Retry { next_attempt_at },
            None => RetryDecision::GiveUp { reason: "retry delay out of range".to_string() },
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay.saturating_mul(2_u32.saturating_pow(exponent));
        let capped = backoff.min(self.max_delay);

        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
