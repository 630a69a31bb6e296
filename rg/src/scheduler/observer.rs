//! Backoff notifications
//!
//! Each scheduler has one observer slot (a new registration replaces the
//! old one) and a broadcast channel for any number of subscribers. Both see
//! one event per rate-limit signal, never one per suspended dispatch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Callback receiving `(is_backing_off, remaining)`
pub type BackoffObserver = Arc<dyn Fn(bool, Duration) + Send + Sync>;

/// A backoff notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffEvent {
    pub is_backing_off: bool,
    pub remaining: Duration,
}

impl BackoffEvent {
    pub fn entered(remaining: Duration) -> Self {
        Self {
            is_backing_off: true,
            remaining,
        }
    }
}

pub(crate) struct ObserverHub {
    slot: Mutex<Option<BackoffObserver>>,
    events: broadcast::Sender<BackoffEvent>,
}

impl ObserverHub {
    pub fn new(capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        Self {
            slot: Mutex::new(None),
            events,
        }
    }

    /// Replace the registered observer; `None` unregisters
    pub fn register(&self, observer: Option<BackoffObserver>) {
        debug!(registered = observer.is_some(), "ObserverHub::register: called");
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackoffEvent> {
        self.events.subscribe()
    }

    /// Deliver to the observer and to subscribers. Must not be called with
    /// scheduler state locked.
    pub fn notify(&self, event: BackoffEvent) {
        let observer = self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(observer) = observer {
            let delivered = catch_unwind(AssertUnwindSafe(|| observer(event.is_backing_off, event.remaining)));
            if delivered.is_err() {
                warn!(?event, "Backoff observer panicked");
            }
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Observer adapter that drops repeats within a quiet period.
///
/// A notification is a repeat when it has the same `is_backing_off` flag as
/// the last one delivered and arrives less than the quiet period after it.
/// Meant for user-facing indicators that should not flash on every retry.
pub struct ThrottledObserver {
    inner: BackoffObserver,
    quiet_period: Duration,
    last: Mutex<Option<(bool, Instant)>>,
}

impl ThrottledObserver {
    pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(5);

    pub fn new<F>(inner: F) -> Self
    where
        F: Fn(bool, Duration) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(inner),
            quiet_period: Self::DEFAULT_QUIET_PERIOD,
            last: Mutex::new(None),
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    /// Forward unless this is a repeat. Returns whether it was forwarded.
    pub fn notify(&self, is_backing_off: bool, remaining: Duration) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((flag, at)) = *last {
                if flag == is_backing_off && now.saturating_duration_since(at) < self.quiet_period {
                    debug!(is_backing_off, "ThrottledObserver::notify: suppressed repeat");
                    return false;
                }
            }
            *last = Some((is_backing_off, now));
        }

        (self.inner)(is_backing_off, remaining);
        true
    }

    /// Turn into a callback for [`Scheduler::register_backoff_observer`](super::Scheduler::register_backoff_observer)
    pub fn into_observer(self) -> BackoffObserver {
        let this = Arc::new(self);
        Arc::new(move |is_backing_off, remaining| {
            this.notify(is_backing_off, remaining);
        })
    }
}
