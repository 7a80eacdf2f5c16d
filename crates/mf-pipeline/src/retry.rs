//! Retry classification and backoff.

use std::time::Duration;

use mf_core::config::RetryConfig;
use mf_core::FailureKind;

/// How stage failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries available to one job across all of its stages.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Whether a crashed tool counts as transient.
    pub retry_on_crash: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            retry_on_crash: cfg.retry_on_crash,
        }
    }

    /// No backoff, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            retry_on_crash: true,
        }
    }

    /// Whether a failure of this kind may succeed on a later attempt.
    ///
    /// Malformed output and unsupported input are deterministic and never
    /// retried.
    pub fn is_transient(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::ToolTimedOut => true,
            FailureKind::ToolCrashed => self.retry_on_crash,
            FailureKind::MalformedOutput | FailureKind::UnsupportedInput => false,
        }
    }

    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `base * 2^retry_count`, capped at `backoff_max`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
