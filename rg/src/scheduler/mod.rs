//! Admission control for outbound requests
//!
//! The scheduler sits between application code and a remote API. Callers
//! submit operations; the scheduler runs them in priority order while
//! keeping the number in flight, the spacing between dispatches and the
//! reaction to 429 responses under control.
//!
//! - [`queue`] - priority-ordered admission queue and stats types
//! - [`backoff`] - exponential cool-down window
//! - `dedup` - collapsing of identical keyed requests
//! - [`observer`] - backoff notifications
//! - [`rate_limit`] - detection of rate-limit signals in errors

pub mod backoff;
mod config;
mod core;
mod dedup;
pub mod observer;
mod operation;
pub mod queue;
pub mod rate_limit;

pub use backoff::BackoffController;
pub use config::SchedulerConfig;
pub use self::core::Scheduler;
pub use observer::{BackoffEvent, BackoffObserver, ThrottledObserver};
pub use operation::SubmitOptions;
pub use queue::{QueueEntry, SchedulerCounters, SchedulerStats};
pub use rate_limit::{RateLimitSignal, detect_rate_limit, is_rate_limited};
