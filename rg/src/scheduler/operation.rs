//! Submitted operations and their type-erased queue form

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::Prioritized;
use super::rate_limit::{RateLimitSignal, detect_rate_limit};
use crate::error::SchedulerError;

/// Per-submission options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Collapse concurrent submissions with the same key into one execution.
    /// Only idempotent, read-style operations should set this.
    pub key: Option<String>,

    /// Higher dispatches first
    pub priority: i32,

    /// Run immediately, skipping the queue, concurrency and backoff checks
    pub bypass_queue: bool,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn bypass(mut self) -> Self {
        self.bypass_queue = true;
        self
    }
}

/// How one attempt of a job ended
pub(crate) enum Outcome {
    /// Caller resolved with the value
    Succeeded,
    /// Caller rejected with the operation error
    Failed,
    /// Caller still waiting; the job comes back for another attempt
    RateLimited {
        job: Box<dyn Job>,
        signal: RateLimitSignal,
        message: String,
    },
}

/// A retryable unit of work bound to the caller waiting on it
pub(crate) trait Job: Send {
    /// Run one attempt, settling the caller unless the attempt was rate limited
    fn run(self: Box<Self>) -> BoxFuture<'static, Outcome>;

    /// Settle the caller with an error without running
    fn reject(self: Box<Self>, error: SchedulerError);

    /// The caller dropped its future, so nobody is waiting for the outcome
    fn is_abandoned(&self) -> bool;
}

pub(crate) struct TypedJob<T, F> {
    op: F,
    reply: oneshot::Sender<Result<T, SchedulerError>>,
}

impl<T, F> TypedJob<T, F> {
    pub(crate) fn new(op: F, reply: oneshot::Sender<Result<T, SchedulerError>>) -> Self {
        Self { op, reply }
    }
}

impl<T, F, Fut> Job for TypedJob<T, F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, Outcome> {
        async move {
            let attempt = (self.op)();
            match attempt.await {
                Ok(value) => {
                    // a dropped receiver means the caller stopped waiting
                    let _ = self.reply.send(Ok(value));
                    Outcome::Succeeded
                }
                Err(err) => match detect_rate_limit(&err) {
                    Some(signal) => Outcome::RateLimited {
                        message: err.to_string(),
                        job: self,
                        signal,
                    },
                    None => {
                        let _ = self.reply.send(Err(SchedulerError::operation(err)));
                        Outcome::Failed
                    }
                },
            }
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: SchedulerError) {
        let _ = self.reply.send(Err(error));
    }

    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// An operation waiting in the admission queue
pub(crate) struct QueuedOperation {
    pub id: Uuid,
    pub key: Option<String>,
    pub priority: i32,
    pub base_priority: i32,
    pub retries: u32,
    pub enqueued_at: Instant,
    pub job: Box<dyn Job>,
}

impl QueuedOperation {
    pub(crate) fn new(key: Option<String>, priority: i32, job: Box<dyn Job>, now: Instant) -> Self {
        Self {
            id: Uuid::now_v7(),
            key,
            priority,
            base_priority: priority,
            retries: 0,
            enqueued_at: now,
            job,
        }
    }
}

impl Prioritized for QueuedOperation {
    fn priority(&self) -> i32 {
        self.priority
    }
}
