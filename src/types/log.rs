//! Diagnostic log entries and the bounded buffer that keeps them.

use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Default number of entries kept before the oldest is evicted.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Subsystem that produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogTag {
    /// Link management.
    Ble,
    /// Inbound data.
    Rx,
    /// Outbound frames.
    Tx,
    /// Mode selection and lifecycle.
    Sys,
    /// Command rejection at the API boundary.
    App,
}

impl LogTag {
    /// Returns the tag as shown in the log stream.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ble => "BLE",
            Self::Rx => "RX",
            Self::Tx => "TX",
            Self::Sys => "SYS",
            Self::App => "APP",
        }
    }
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal events.
    Info,
    /// Degraded but recoverable.
    Warn,
    /// Failures.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One line of the diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Monotonic id, unique within one supervisor.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Producing subsystem.
    pub tag: LogTag,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
}

impl LogEntry {
    /// Creates an entry stamped with the current wall-clock time.
    #[must_use]
    pub fn now(id: u64, tag: LogTag, level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            id,
            timestamp_ms,
            tag,
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.tag, self.level, self.message)
    }
}

/// Append-only ring buffer of log entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Creates an empty buffer holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry, evicting the oldest when full.
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Returns the number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Returns a copy of the buffered entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> LogEntry {
        LogEntry::now(id, LogTag::Sys, LogLevel::Info, format!("entry {id}"))
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = LogBuffer::new(3);
        for id in 0..5 {
            buffer.push(entry(id));
        }
        let ids: Vec<u64> = buffer.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut buffer = LogBuffer::new(0);
        buffer.push(entry(1));
        buffer.push(entry(2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.snapshot()[0].id, 2);
    }

    #[test]
    fn test_entry_display() {
        let e = LogEntry::now(1, LogTag::Tx, LogLevel::Warn, "slow");
        assert_eq!(e.to_string(), "[TX] WARN slow");
    }
}
