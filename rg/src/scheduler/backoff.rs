//! Exponential cool-down window shared by every queued operation
//!
//! The controller is either idle or backing off until a deadline. Each
//! rate-limit signal opens a window of the current duration and then grows
//! the duration for the next signal, capped at the configured maximum. Only
//! a successful dispatch or an explicit reset brings the duration back down.

use std::time::Duration;

use tokio::time::Instant;

use super::config::SchedulerConfig;

/// Stand-in deadline for windows too long to represent as an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, or a deadline decades away when that overflows
pub(crate) fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct BackoffController {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    until: Option<Instant>,
}

impl BackoffController {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            initial,
            max,
            multiplier,
            current: initial,
            until: None,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.initial_backoff(), config.max_backoff(), config.backoff_multiplier)
    }

    /// Duration the next rate-limit signal will open
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        self.until
    }

    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Time left in the window, zero when idle
    pub fn remaining(&self, now: Instant) -> Duration {
        self.until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Open a cool-down window and grow the next one.
    ///
    /// The window is the current duration, or the server's hint if that is
    /// longer, never more than the maximum. An already open window is never
    /// shortened. Returns the length of the window just opened.
    pub fn record_rate_limit(&mut self, now: Instant, retry_after: Option<Duration>) -> Duration {
        let window = retry_after
            .map_or(self.current, |hint| hint.max(self.current))
            .min(self.max);

        let until = deadline(now, window);
        self.until = Some(self.until.map_or(until, |existing| existing.max(until)));
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |grown| grown.min(self.max));

        window
    }

    /// A dispatch succeeded; the next window starts from the initial duration
    pub fn record_success(&mut self) {
        self.current = self.initial;
    }

    /// Drop any open window and start over
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.until = None;
    }
}
