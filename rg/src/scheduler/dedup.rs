//! Short-lived registry collapsing identical in-flight requests

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SchedulerError;

/// The future every caller of a deduplicated request awaits
pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<T, SchedulerError>>>;

struct PendingDedupEntry {
    created_at: Instant,
    /// A `SharedResult<T>` for the `T` of the first submission
    future: Box<dyn Any + Send>,
}

#[derive(Default)]
pub(crate) struct Deduplicator {
    entries: HashMap<String, PendingDedupEntry>,
}

impl Deduplicator {
    /// Shared future for `key` if it was registered less than `window` ago.
    ///
    /// An entry registered for a different result type is a miss.
    pub fn lookup<T>(&self, key: &str, now: Instant, window: Duration) -> Option<SharedResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.get(key)?;
        if now.saturating_duration_since(entry.created_at) >= window {
            return None;
        }

        let shared = entry.future.downcast_ref::<SharedResult<T>>().cloned();
        if shared.is_none() {
            debug!(%key, "Deduplicator::lookup: key registered with a different result type");
        }
        shared
    }

    /// Register (or replace) the entry for `key`
    pub fn register<T>(&mut self, key: String, future: SharedResult<T>, now: Instant)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries.insert(
            key,
            PendingDedupEntry {
                created_at: now,
                future: Box::new(future),
            },
        );
    }

    /// Remove the entry for `key` if it is at least `window` old.
    /// Returns whether an entry was removed.
    pub fn sweep(&mut self, key: &str, now: Instant, window: Duration) -> bool {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| now.saturating_duration_since(entry.created_at) >= window);
        if expired {
            self.entries.remove(key);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
