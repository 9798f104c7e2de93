//! Readiness detection for a booting dev server.
//!
//! Two stages keep the diagnosis backend off the hot path:
//!
//! ```text
//! WATCHING   → chunk arrives        → append to trailing buffer
//!            → cheap keyword match  → (throttled) ask backend to verify
//! CONFIRMED  → backend said ready   → signal once, ignore further output
//! ABANDONED  → boot timeout fired   → ignore further output
//! ```
//!
//! The detector never talks to the backend itself. [`ReadinessDetector::observe`]
//! hands back the excerpt to verify and the caller reports the verdict through
//! [`ReadinessDetector::accept`].

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::diagnosis::ReadinessVerdict;

static READY_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ready|listening|localhost|https?:|compiled|built in").unwrap()
});

/// Remove ANSI escape sequences (colors, cursor movement, OSC titles).
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Cheap local check for startup-complete wording.
pub fn looks_ready(text: &str) -> bool {
    READY_HINT_RE.is_match(&strip_ansi(text))
}

/// Last `max_chars` characters of `s`, respecting char boundaries.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match s.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Detector settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessSettings {
    /// Minimum spacing between two verification requests.
    pub throttle: Duration,
    /// How much trailing stdout to retain.
    pub buffer_chars: usize,
    /// How much of the buffer to send for verification.
    pub excerpt_chars: usize,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(3),
            buffer_chars: 5000,
            excerpt_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessState {
    /// Boot output is being inspected.
    Watching,
    /// The backend confirmed readiness; carries the reported URL.
    Confirmed { url: Option<String> },
    /// Gave up (boot timeout or process gone).
    Abandoned,
}

/// Emitted exactly once per process lifetime when readiness is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadySignal {
    pub url: Option<String>,
    pub port: Option<u16>,
}

pub struct ReadinessDetector {
    settings: ReadinessSettings,
    state: ReadinessState,
    buffer: String,
    last_check: Option<Instant>,
}

impl ReadinessDetector {
    pub fn new(settings: ReadinessSettings) -> Self {
        Self {
            settings,
            state: ReadinessState::Watching,
            buffer: String::new(),
            last_check: None,
        }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    /// Start over for a new process.
    pub fn reset(&mut self) {
        self.state = ReadinessState::Watching;
        self.buffer.clear();
        self.last_check = None;
    }

    /// Stop checking for this process lifetime.
    pub fn abandon(&mut self) {
        if self.state == ReadinessState::Watching {
            self.state = ReadinessState::Abandoned;
        }
    }

    /// Trailing boot output collected so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Feed a stdout chunk.
    ///
    /// Returns the excerpt to verify when the chunk looks like a readiness
    /// message and no verification was requested within the throttle window.
    pub fn observe(&mut self, chunk: &str, now: Instant) -> Option<String> {
        if self.state != ReadinessState::Watching {
            return None;
        }

        self.buffer.push_str(chunk);
        let keep = tail_chars(&self.buffer, self.settings.buffer_chars).len();
        if keep < self.buffer.len() {
            self.buffer.drain(..self.buffer.len() - keep);
        }

        if !looks_ready(chunk) {
            return None;
        }

        let throttled = self
            .last_check
            .is_some_and(|last| now.saturating_duration_since(last) < self.settings.throttle);
        if throttled {
            debug!("readiness hint throttled");
            return None;
        }
        self.last_check = Some(now);

        Some(tail_chars(&self.buffer, self.settings.excerpt_chars).to_string())
    }

    /// Apply a verification verdict. Returns the signal on first confirmation.
    pub fn accept(&mut self, verdict: &ReadinessVerdict) -> Option<ReadySignal> {
        if self.state != ReadinessState::Watching || !verdict.is_ready {
            return None;
        }
        self.state = ReadinessState::Confirmed {
            url: verdict.url.clone(),
        };
        Some(ReadySignal {
            url: verdict.url.clone(),
            port: verdict.port,
        })
    }
}
