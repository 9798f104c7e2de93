//! Reports emitted by the control loop.
//!
//! Every report is a self-describing, timestamped message. Consumers (the CLI
//! printer, the session journal, an overlay) subscribe to one channel and
//! dispatch on the `type` tag.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::control::Phase;
use crate::diagnosis::Verdict;
use crate::log::LogEntry;

/// Where reports are delivered.
pub type ReportSink = mpsc::UnboundedSender<Report>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ReportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportKind {
    /// The control loop moved to a new phase.
    #[serde(rename = "state_update")]
    PhaseChanged { phase: Phase },
    /// Captured log entries, oldest first.
    LogBatch { entries: Vec<LogEntry> },
    /// The server finished booting, or the boot timeout gave up on it.
    Readiness {
        url: Option<String>,
        port: Option<u16>,
        degraded: bool,
    },
    /// A diagnosis verdict for a crash, with the feedback shown to the user.
    Analysis {
        verdict: Verdict,
        attempt_count: u32,
        max_retries: u32,
        feedback: String,
    },
}

impl Report {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn phase_changed(phase: Phase) -> Self {
        Self::new(ReportKind::PhaseChanged { phase })
    }

    pub fn log_batch(entries: Vec<LogEntry>) -> Self {
        Self::new(ReportKind::LogBatch { entries })
    }

    pub fn ready(url: Option<String>, port: Option<u16>) -> Self {
        Self::new(ReportKind::Readiness {
            url,
            port,
            degraded: false,
        })
    }

    pub fn degraded() -> Self {
        Self::new(ReportKind::Readiness {
            url: None,
            port: None,
            degraded: true,
        })
    }

    pub fn analysis(verdict: Verdict, attempt_count: u32, max_retries: u32, feedback: String) -> Self {
        Self::new(ReportKind::Analysis {
            verdict,
            attempt_count,
            max_retries,
            feedback,
        })
    }
}

/// One-line summary for terminal output. Log batches are not summarized
/// here; printers render their entries individually.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReportKind::PhaseChanged { phase } => write!(f, "phase → {phase}"),
            ReportKind::LogBatch { entries } => write!(f, "{} log entries", entries.len()),
            ReportKind::Readiness {
                degraded: true, ..
            } => write!(f, "readiness timed out; assuming running"),
            ReportKind::Readiness { url, port, .. } => match (url, port) {
                (Some(url), _) => write!(f, "server ready at {url}"),
                (None, Some(port)) => write!(f, "server ready on port {port}"),
                (None, None) => write!(f, "server ready"),
            },
            ReportKind::Analysis {
                verdict,
                attempt_count,
                max_retries,
                ..
            } => write!(
                f,
                "analysis {attempt_count}/{max_retries}: {}",
                crate::feedback::headline(verdict)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogLevel, LogSource};

    #[test]
    fn phase_change_uses_state_update_tag() {
        let json = serde_json::to_value(Report::phase_changed(Phase::Bootstrapping)).unwrap();
        assert_eq!(json["type"], "state_update");
        assert_eq!(json["phase"], "bootstrapping");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn log_batch_carries_entries() {
        let entry = LogEntry::new(3, Utc::now(), LogSource::Stderr, LogLevel::Error, "boom");
        let json = serde_json::to_value(Report::log_batch(vec![entry])).unwrap();
        assert_eq!(json["type"], "log_batch");
        assert_eq!(json["entries"][0]["content"], "boom");
        assert_eq!(json["entries"][0]["source"], "stderr");
    }

    #[test]
    fn analysis_report_includes_attempt_metadata() {
        let verdict = Verdict {
            has_error: true,
            error_type: Some("syntax".into()),
            ..Verdict::fallback("Unexpected token")
        };
        let report = Report::analysis(verdict, 2, 5, "Error Detected".into());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "analysis");
        assert_eq!(json["attempt_count"], 2);
        assert_eq!(json["max_retries"], 5);
        assert_eq!(json["verdict"]["hasError"], true);
        assert_eq!(report.to_string(), "analysis 2/5: syntax detected.");
    }

    #[test]
    fn reports_round_trip_through_json() {
        let report = Report::ready(Some("http://localhost:3000".into()), Some(3000));
        let json = serde_json::to_string(&report).unwrap();
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn display_summaries() {
        assert_eq!(
            Report::phase_changed(Phase::MaxRetriesReached).to_string(),
            "phase → max_retries_reached"
        );
        assert_eq!(
            Report::ready(None, Some(5173)).to_string(),
            "server ready on port 5173"
        );
        assert_eq!(
            Report::degraded().to_string(),
            "readiness timed out; assuming running"
        );
    }
}
