//! Scheduler configuration

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max operations executing at once
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    /// Minimum spacing between two dispatches in milliseconds
    #[serde(rename = "min-delay-ms")]
    pub min_delay_ms: u64,

    /// First cool-down window after a rate limit, in milliseconds
    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the cool-down window, in milliseconds
    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,

    /// Growth factor applied after every rate limit
    #[serde(rename = "backoff-multiplier")]
    pub backoff_multiplier: f64,

    /// How long a keyed request collapses identical submissions, in milliseconds
    #[serde(rename = "dedupe-window-ms")]
    pub dedupe_window_ms: u64,

    /// Priority added to a rate-limited operation when it is requeued
    #[serde(rename = "retry-priority-boost")]
    pub retry_priority_boost: i32,

    /// Give up after this many rate limits for one operation (unbounded if unset)
    #[serde(rename = "max-rate-limit-retries", skip_serializing_if = "Option::is_none")]
    pub max_rate_limit_retries: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_delay_ms: 50,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            dedupe_window_ms: 100,
            retry_priority_boost: 100,
            max_rate_limit_retries: None,
        }
    }
}

impl SchedulerConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    /// Reject settings the dispatch loop cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(eyre!("max-concurrent must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(eyre!(
                "backoff-multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(eyre!(
                "initial-backoff-ms ({}) must not exceed max-backoff-ms ({})",
                self.initial_backoff_ms,
                self.max_backoff_ms
            ));
        }
        Ok(())
    }
}
