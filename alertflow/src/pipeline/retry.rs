//! Exponential backoff with jitter for transient transport failures.
//!
//! `delay = min(max_delay, base_delay * 2^(attempts - 1))`, plus a random
//! jitter in `[0, jitter_ratio * delay]`.

use chrono::Duration;
use rand::Rng;

use crate::config::RetryConfig;
use crate::utils::{saturating_add, to_chrono, Timestamp};

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time.
    Retry {
        /// When the unit becomes due again.
        next_retry_at: Timestamp,
    },
    /// Attempts are used up; fail terminally.
    Exhausted,
}

/// Backoff calculator over a [`RetryConfig`] snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy<'a> {
    config: &'a RetryConfig,
}

impl<'a> RetryPolicy<'a> {
    /// Wraps a retry config.
    #[must_use]
    pub const fn new(config: &'a RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the un-jittered delay after `attempts` failures, in ms.
    #[must_use]
    pub fn base_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(63);
        self.config
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.config.max_delay_ms)
    }

    /// Returns the jittered delay after `attempts` failures.
    pub fn delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_ms(attempts);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let jitter_cap = (delay as f64 * self.config.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_cap)
        };
        millis(delay.saturating_add(jitter))
    }

    /// Returns the largest delay [`delay`](Self::delay) can produce.
    #[must_use]
    pub fn max_jittered_delay(&self) -> Duration {
        let max = self.config.max_delay_ms;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let jitter = (max as f64 * self.config.jitter_ratio.clamp(0.0, 1.0)) as u64;
        millis(max.saturating_add(jitter))
    }

    /// Decides what follows a transient failure.
    ///
    /// `attempts` counts transport calls including the one that just failed.
    /// A provider `retry_after` hint pushes the retry later, never earlier,
    /// and is capped at `max_delay_ms`. The result saturates at the latest
    /// representable instant.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempts: u32,
        now: Timestamp,
        retry_after: Option<std::time::Duration>,
        rng: &mut R,
    ) -> RetryDecision {
        if attempts >= self.config.max_attempts {
            return RetryDecision::Exhausted;
        }
        let mut next_retry_at = saturating_add(now, self.delay(attempts, rng));
        if let Some(hint) = retry_after {
            let hint = hint.min(std::time::Duration::from_millis(self.config.max_delay_ms));
            next_retry_at = next_retry_at.max(saturating_add(now, to_chrono(hint)));
        }
        RetryDecision::Retry { next_retry_at }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
