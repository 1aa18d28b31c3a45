//! Retry and timeout policy shared by every HTTP call.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ApiError;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Deadline across all attempts of one call.
    pub total_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 6,
            request_timeout: Duration::from_secs(15),
            total_deadline: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_ms),
            cap: Duration::from_millis(cfg.cap_ms),
            max_attempts: cfg.max_attempts.max(1),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            total_deadline: Duration::from_secs(cfg.total_deadline_secs),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff window before retry number `retry`
    /// (0-based): `min(cap, base * 2^retry)`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay in `[0, ceiling(retry)]`.
    pub fn backoff<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }

    /// Delay before retrying after `err`. A server-provided `Retry-After`
    /// wins over the computed backoff.
    pub fn delay_for(&self, retry: u32, err: &ApiError) -> Duration {
        match err.retry_after() {
            Some(hint) => hint,
            None => self.backoff(retry, &mut rand::thread_rng()),
        }
    }
}
