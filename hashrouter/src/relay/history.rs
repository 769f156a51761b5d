//! Bounded record of where the relay has sent hashrate.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::Destination;

/// Why the active destination changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeReason {
    Initial,
    Switch,
    Revert,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub destination: Destination,
    pub reason: ChangeReason,
    pub started_at: Instant,
    /// Time spent on this destination. `None` while it is still active.
    pub duration: Option<Duration>,
}

/// Ring buffer of destination changes. When full, the oldest entry is
/// dropped.
#[derive(Debug)]
pub struct DestinationHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl DestinationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record that `destination` became active now, closing out the
    /// previous entry's duration.
    pub fn record(&mut self, destination: Destination, reason: ChangeReason) {
        let now = Instant::now();
        if let Some(last) = self.entries.back_mut() {
            last.duration = Some(now.duration_since(last.started_at));
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            destination,
            reason,
            started_at: now,
            duration: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}
