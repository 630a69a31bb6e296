//! reqgate - Client-side admission control for outbound API requests
//!
//! reqgate sits between application code and a remote API and decides when
//! each call may run, so a shared backend is never overwhelmed and a 429
//! response turns into a paced retry instead of a cascade of failures.
//!
//! # Core Concepts
//!
//! - **Priority admission**: operations wait in a priority-ordered queue
//! - **Bounded concurrency**: at most `max-concurrent` operations in flight,
//!   spaced at least `min-delay-ms` apart
//! - **Shared backoff**: a rate-limited operation pauses all dispatch for an
//!   exponentially growing window and is retried ahead of fresh work
//! - **Deduplication**: identical keyed requests within a short window share
//!   one execution
//!
//! # Modules
//!
//! - [`scheduler`] - the admission controller
//! - [`error`] - scheduler and operation error types
//! - [`config`] - configuration types and loading
//! - [`simulate`] - synthetic workload for trying settings out
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod simulate;

// Re-export commonly used types
pub use config::{Config, SimulationConfig};
pub use error::{SchedulerError, StatusError};
pub use scheduler::{
    BackoffEvent, BackoffObserver, QueueEntry, Scheduler, SchedulerConfig, SchedulerStats, SubmitOptions,
    ThrottledObserver,
};
pub use simulate::{FakeBackend, SimulationReport, run_simulation};
