//! Session journal: JSON lines per run.
//!
//! The CLI appends every report the control loop emits (phase changes, log
//! batches, readiness, analysis) to a `.jsonl` file so a session can be
//! grepped or replayed after the fact. Each line is a self-contained JSON
//! object carrying its own timestamp.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

use crate::events::Report;

/// Writer for JSON lines session journals.
pub struct Journal {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl Journal {
    /// Open a journal at the given path, appending to an existing file.
    ///
    /// Creates parent directories as needed.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open journal file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Fresh journal path for a new session under `log_dir`.
    pub fn session_path(log_dir: &Path) -> PathBuf {
        log_dir.join(format!("session-{}.jsonl", uuid::Uuid::new_v4()))
    }

    /// Append one report.
    pub fn record(&self, report: &Report) -> Result<()> {
        let json = serde_json::to_string(report).context("failed to serialize report")?;
        debug!(bytes = json.len(), "journal record");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("journal writer lock poisoned"))?;
        writeln!(writer, "{json}").context("failed to write journal entry")?;
        writer.flush().context("failed to flush journal")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;
    use crate::log::{LogEntry, LogLevel, LogSource};
    use chrono::Utc;

    #[test]
    fn writes_one_json_object_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.jsonl");
        let journal = Journal::new(&path).unwrap();

        journal
            .record(&Report::phase_changed(Phase::Starting))
            .unwrap();
        journal
            .record(&Report::log_batch(vec![LogEntry::new(
                1,
                Utc::now(),
                LogSource::Stdout,
                LogLevel::Info,
                "hello",
            )]))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("type").is_some());
            assert!(parsed.get("timestamp").is_some());
        }
        assert!(lines[0].contains("\"type\":\"state_update\""));
        assert!(lines[1].contains("\"type\":\"log_batch\""));
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deep").join("nested").join("run.jsonl");
        let journal = Journal::new(&path).unwrap();
        journal.record(&Report::phase_changed(Phase::Idle)).unwrap();
        assert!(path.exists());
        assert_eq!(journal.path(), path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("append.jsonl");
        {
            let journal = Journal::new(&path).unwrap();
            journal.record(&Report::phase_changed(Phase::Idle)).unwrap();
        }
        {
            let journal = Journal::new(&path).unwrap();
            journal
                .record(&Report::phase_changed(Phase::Healthy))
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn session_paths_are_unique() {
        let dir = Path::new("/tmp/logs");
        let a = Journal::session_path(dir);
        let b = Journal::session_path(dir);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".jsonl"));
    }
}
