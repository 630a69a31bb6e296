//! Queue types for the scheduler

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Anything that can wait in the admission queue
pub trait Prioritized {
    fn priority(&self) -> i32;
}

/// Pending operations ordered by descending priority.
///
/// New entries go behind every entry of equal priority, so equal priorities
/// dispatch in submission order. Retried entries go in front of their band.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    entries: VecDeque<T>,
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T: Prioritized> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first entry with strictly lower priority.
    /// Returns the index the entry landed at.
    pub fn push(&mut self, entry: T) -> usize {
        let priority = entry.priority();
        let index = self
            .entries
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
        index
    }

    /// Insert before the first entry with equal or lower priority
    pub fn push_front_of_band(&mut self, entry: T) -> usize {
        let priority = entry.priority();
        let index = self
            .entries
            .iter()
            .position(|queued| queued.priority() <= priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
        index
    }

    /// Take the highest-priority entry
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Remove every entry, in dispatch order
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }
}

/// Cumulative scheduler counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerCounters {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub deduplicated: u64,
    pub bypassed: u64,
    pub cancelled: u64,
    pub peak_queue_depth: usize,
    pub peak_concurrent: usize,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queue_length: usize,
    pub active_requests: usize,
    pub is_backing_off: bool,
    #[serde(rename = "backoff_remaining_ms", serialize_with = "as_millis")]
    pub backoff_remaining: Duration,
    pub counters: SchedulerCounters,
}

/// Queue entry for display
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub priority: i32,
    pub key: Option<String>,
    pub retries: u32,
    #[serde(rename = "waiting_ms", serialize_with = "as_millis")]
    pub waiting: Duration,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
