//! Captured process output: log entries and the bounded ring that holds them.
//!
//! Every chunk the supervised process writes, plus the lines the control loop
//! adds itself (exit notices, diagnosis feedback), becomes a [`LogEntry`] in a
//! [`LogRing`]. The ring keeps a capped history for evidence selection and a
//! small pending batch that is handed to a listener either when it fills up
//! or when the flush interval elapses, whichever comes first.

pub mod journal;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines written by the control loop (exit notices, timeouts).
    System,
    /// Lines carrying diagnosis output (readiness, analysis feedback).
    Diagnosis,
    Ide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Upper-case label used when rendering evidence lines.
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One immutable captured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic per-ring identifier; also the tie-breaker for ordering.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    /// Raw text, possibly multi-line or a partial line.
    pub content: String,
}

impl LogEntry {
    pub fn new(
        id: u64,
        timestamp: DateTime<Utc>,
        source: LogSource,
        level: LogLevel,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            timestamp,
            source,
            level,
            content: content.into(),
        }
    }
}

/// Size and timing bounds for a [`LogRing`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureLimits {
    /// Maximum number of entries retained in history.
    pub history_limit: usize,
    /// Pending entries that force an immediate flush.
    pub flush_batch_size: usize,
    /// How long a pending batch may wait before it is flushed.
    pub flush_interval: Duration,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            history_limit: 2000,
            flush_batch_size: 1000,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// What the owner of the ring must do about the flush timer after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSchedule {
    /// The batch filled up and was flushed; any armed timer can be cancelled.
    Flushed,
    /// First entry of a new batch; arm a timer for this long.
    ArmTimer(Duration),
    /// A timer is already armed for the current batch.
    Pending,
}

type BatchListener = Box<dyn FnMut(Vec<LogEntry>) + Send>;

/// Bounded, append-only history of log entries with batched notification.
///
/// The ring does not own a clock-driven timer itself. `append` reports when
/// a timer should be armed and the owner calls [`LogRing::flush`] when it
/// fires, which keeps the ring synchronous and usable from a single event
/// loop without locking.
pub struct LogRing {
    history: VecDeque<LogEntry>,
    pending: Vec<LogEntry>,
    limits: CaptureLimits,
    next_id: u64,
    timer_armed: bool,
    listener: Option<BatchListener>,
}

impl LogRing {
    pub fn new(limits: CaptureLimits) -> Self {
        Self {
            history: VecDeque::with_capacity(limits.history_limit.min(4096)),
            pending: Vec::new(),
            limits,
            next_id: 1,
            timer_armed: false,
            listener: None,
        }
    }

    /// Register the batch listener, replacing any previous one.
    pub fn set_listener<F>(&mut self, listener: F)
    where
        F: FnMut(Vec<LogEntry>) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    /// Record a new entry stamped with the current time.
    pub fn append(
        &mut self,
        source: LogSource,
        content: impl Into<String>,
        level: LogLevel,
    ) -> FlushSchedule {
        self.append_at(Utc::now(), source, content, level)
    }

    /// Record a new entry with an explicit timestamp.
    ///
    /// Timestamps earlier than the newest retained entry are clamped forward
    /// so history stays in non-decreasing order even if the wall clock steps
    /// backwards.
    pub fn append_at(
        &mut self,
        timestamp: DateTime<Utc>,
        source: LogSource,
        content: impl Into<String>,
        level: LogLevel,
    ) -> FlushSchedule {
        let timestamp = match self.history.back() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };

        let entry = LogEntry::new(self.next_id, timestamp, source, level, content);
        self.next_id += 1;

        self.history.push_back(entry.clone());
        while self.history.len() > self.limits.history_limit {
            self.history.pop_front();
        }
        self.pending.push(entry);

        if self.pending.len() >= self.limits.flush_batch_size {
            self.flush();
            FlushSchedule::Flushed
        } else if !self.timer_armed {
            self.timer_armed = true;
            FlushSchedule::ArmTimer(self.limits.flush_interval)
        } else {
            FlushSchedule::Pending
        }
    }

    /// Hand the pending batch to the listener and clear it.
    ///
    /// Returns the number of entries delivered; an empty batch is a no-op.
    pub fn flush(&mut self) -> usize {
        self.timer_armed = false;
        if self.pending.is_empty() {
            return 0;
        }

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        trace!(count, "flushing log batch");
        if let Some(listener) = self.listener.as_mut() {
            listener(batch);
        }
        count
    }

    /// Flush whatever is still pending; used on shutdown.
    pub fn shutdown(&mut self) -> usize {
        self.flush()
    }

    /// Copy of the retained history, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.history.iter().cloned().collect()
    }

    /// Drop retained history and any pending batch.
    pub fn clear(&mut self) {
        self.history.clear();
        self.pending.clear();
        self.timer_armed = false;
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
