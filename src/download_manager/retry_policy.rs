//! Retry policy for failed fetches.
//!
//! Exponential backoff with jitter. Rate-limited failures wait at least a
//! configured minimum before retrying; unknown failures are retried once.

use rand::Rng;

use super::models::FailureKind;
use crate::config::PipelineSettings;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first) before permanent failure.
    pub max_attempts: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each attempt.
    pub backoff_multiplier: f64,
    /// Minimum backoff for rate-limited failures.
    pub rate_limit_min_backoff_secs: u64,
    /// Fraction of the backoff randomized in both directions (0.2 = +/-20%).
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
            rate_limit_min_backoff_secs: settings.rate_limit_min_backoff_secs,
            jitter_ratio: settings.jitter_ratio,
        }
    }

    /// Whether a failure of `kind` on attempt number `attempt` (1-based)
    /// should be retried.
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        if !kind.is_retryable() {
            return false;
        }
        // Unknown failures get a single retry before being surfaced.
        if kind == FailureKind::Unknown && attempt >= 2 {
            return false;
        }
        attempt < self.max_attempts
    }

    /// Backoff in seconds after `attempt` attempts, without jitter.
    pub fn backoff_secs(&self, kind: FailureKind, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        let mut capped = backoff.min(self.max_backoff_secs as f64) as u64;
        if kind == FailureKind::RateLimited {
            capped = capped.max(self.rate_limit_min_backoff_secs);
        }
        capped
    }

    /// Unix timestamp at which the next attempt may start, with jitter applied.
    pub fn next_retry_at(&self, kind: FailureKind, attempt: u32) -> i64 {
        let backoff = self.backoff_secs(kind, attempt) as f64;
        let jittered = backoff * self.jitter_factor();
        chrono::Utc::now().timestamp() + jittered.round() as i64
    }

    fn jitter_factor(&self) -> f64 {
        if self.jitter_ratio <= 0.0 {
            return 1.0;
        }
        let r = self.jitter_ratio.min(1.0);
        rand::rng().random_range((1.0 - r)..=(1.0 + r))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 900,
            backoff_multiplier: 2.0,
            rate_limit_min_backoff_secs: 60,
            jitter_ratio: 0.2,
        }
    }
}
