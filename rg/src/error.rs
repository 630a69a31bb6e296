//! Error types for the scheduler and for wrapped operations

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors delivered to callers of [`Scheduler::submit`](crate::scheduler::Scheduler::submit)
///
/// The type is `Clone` so that every caller sharing a deduplicated request
/// receives the same rejection.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The wrapped operation failed with a non-rate-limit error
    #[error("{0}")]
    Operation(Arc<eyre::Report>),

    /// The operation was still queued when the queue was cleared
    #[error("Request cancelled: queue was cleared")]
    QueueCleared,

    /// The operation was rate limited more often than the configured cap allows
    #[error("Rate limited {attempts} times, giving up: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// The operation panicked or its task was dropped before it settled
    #[error("Request abandoned before it settled")]
    Abandoned,
}

impl SchedulerError {
    /// Wrap an operation failure
    pub fn operation(err: eyre::Report) -> Self {
        Self::Operation(Arc::new(err))
    }

    /// The original operation error, if this is one
    pub fn operation_error(&self) -> Option<&eyre::Report> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Check if the request was cancelled by `clear_queue`
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::QueueCleared)
    }
}

/// An HTTP-style failure reported by a wrapped operation
///
/// Operations that talk to an HTTP backend can return this (wrapped in an
/// `eyre::Report`) so the scheduler can see the status code. A status of 429
/// is treated as a rate-limit signal; `retry_after` carries the server's
/// `Retry-After` hint when one was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("HTTP {status}: {message}")]
pub struct StatusError {
    pub status: u16,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl StatusError {
    pub const TOO_MANY_REQUESTS: u16 = 429;

    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A 429 response
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(Self::TOO_MANY_REQUESTS, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status == Self::TOO_MANY_REQUESTS
    }
}
