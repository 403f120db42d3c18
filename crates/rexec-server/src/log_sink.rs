//! Bounded operator log.
//!
//! Keeps the last N timestamped lines so an attached display can show recent
//! history without the server keeping unbounded state. Every line is also
//! mirrored to `tracing` and broadcast to live subscribers.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::info;

/// Capacity of the live subscriber channel.
const SUBSCRIBER_BUFFER: usize = 256;

/// A single timestamped log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"), self.text)
    }
}

/// A fixed-capacity, append-only log with FIFO eviction.
#[derive(Debug)]
pub struct LogSink {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    live: broadcast::Sender<LogEntry>,
}

impl LogSink {
    /// Create a sink holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            live,
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock cannot leave the deque half-edited.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Timestamp and append a line, evicting the oldest entry when full.
    pub fn append(&self, text: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: Local::now(),
            text: text.into(),
        };
        info!("{}", entry.text);

        if self.capacity > 0 {
            let mut entries = self.entries();
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No subscribers is fine.
        let _ = self.live.send(entry.clone());
        entry
    }

    /// All buffered entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries().iter().cloned().collect()
    }

    /// Buffered entries rendered one per line.
    pub fn render(&self) -> String {
        self.entries()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drop every buffered entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Receive every entry appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
