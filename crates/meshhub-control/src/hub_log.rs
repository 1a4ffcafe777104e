//! Bounded log of hub events exposed over the API

use chrono::Utc;
use meshhub_proto::{LogEntry, LogLevel};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

/// Ring buffer of the most recent operational events.
///
/// Every entry is also emitted through `tracing`.
pub struct HubLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl HubLog {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "meshhub::hub_log", "{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "meshhub::hub_log", "{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(target: "meshhub::hub_log", "{}", message);
        self.push(LogLevel::Error, message);
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    fn push(&self, level: LogLevel, message: String) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            time: Utc::now(),
            level,
            message,
        });
    }
}

impl Default for HubLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
