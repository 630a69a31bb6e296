//! Rate-limit detection for wrapped operation errors
//!
//! An operation signals "rate limited" when anything in its error chain is a
//! [`StatusError`] or `reqwest::Error` with status 429, or has a message that
//! mentions 429, "rate limit" or "too many requests" (case-insensitive).
//! Everything else is a terminal failure.

use std::time::Duration;

use reqwest::StatusCode;

use crate::error::StatusError;

const RATE_LIMIT_MARKERS: [&str; 3] = ["429", "rate limit", "too many requests"];

/// A detected rate-limit signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// Server-suggested wait, when the error carried one
    pub retry_after: Option<Duration>,
}

/// Inspect an operation error for a rate-limit signal
pub fn detect_rate_limit(err: &eyre::Report) -> Option<RateLimitSignal> {
    for cause in err.chain() {
        if let Some(status) = cause.downcast_ref::<StatusError>() {
            if status.is_rate_limit() {
                return Some(RateLimitSignal {
                    retry_after: status.retry_after,
                });
            }
        }

        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
                return Some(RateLimitSignal::default());
            }
        }

        let message = cause.to_string().to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|marker| message.contains(marker)) {
            return Some(RateLimitSignal::default());
        }
    }

    None
}

/// Convenience check when the hint is not needed
pub fn is_rate_limited(err: &eyre::Report) -> bool {
    detect_rate_limit(err).is_some()
}
