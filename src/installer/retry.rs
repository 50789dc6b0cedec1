//! Bounded retry with exponential backoff for transient package manager failures.

use std::time::Duration;

use crate::config::InstallConfig;

use super::FailureKind;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Cap on a single wait.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &InstallConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_secs(config.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            ..Self::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Network and stale-catalog failures are worth another attempt; conflicts
    /// are deterministic and go straight to triage.
    pub fn should_retry(&self, kind: FailureKind) -> bool {
        matches!(kind, FailureKind::Transient | FailureKind::Missing)
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base_millis = self.initial_backoff.as_millis() as f64;
        let multiplier = self.backoff_multiplier.powi(retry as i32 - 1);
        let backoff = Duration::from_millis((base_millis * multiplier) as u64);
        backoff.min(self.max_backoff)
    }

    pub fn wait(&self, retry: u32) {
        let backoff = self.backoff_duration(retry);
        if !backoff.is_zero() {
            std::thread::sleep(backoff);
        }
    }
}
