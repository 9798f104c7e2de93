//! Evidence selection: turns the captured history into a compact excerpt.
//!
//! Diagnosis quality depends on seeing the failure, not just the tail, so the
//! excerpt is built from two parts:
//!
//! 1. **Error blocks**: every error-indicating entry with up to
//!    [`LINES_BEFORE`] entries of leading context and up to [`LINES_AFTER`]
//!    trailing non-error entries. A new error inside the trailing window
//!    extends the block instead of starting a new one.
//! 2. **Recent window**: the last [`RECENT_WINDOW`] entries, always.
//!
//! When the newest error-block entry is more than [`DIVIDER_GAP_MS`] older
//! than the start of the recent window the two parts are rendered with a
//! divider between them; otherwise they are merged chronologically.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::log::{LogEntry, LogLevel, LogSource};

/// Returned for an empty history. Callers treat it as "nothing to analyze".
pub const NO_LOGS_SENTINEL: &str = "No logs captured.";

/// Separator rendered between old error blocks and the recent window.
pub const RECENT_DIVIDER: &str = "\n--- RECENT LOGS ---\n";

pub const LINES_BEFORE: usize = 5;
pub const LINES_AFTER: usize = 20;
pub const RECENT_WINDOW: usize = 50;
pub const DIVIDER_GAP_MS: i64 = 1000;

const ERROR_KEYWORDS: [&str; 4] = ["error", "exception", "fail", "fatal"];

/// True if the entry should anchor an error block.
pub fn is_error_indicating(entry: &LogEntry) -> bool {
    if entry.level == LogLevel::Error {
        return true;
    }
    let lower = entry.content.to_lowercase();
    ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Build the diagnosis excerpt for `history` (oldest first).
pub fn select_for_analysis(history: &[LogEntry]) -> String {
    if history.is_empty() {
        return NO_LOGS_SENTINEL.to_string();
    }

    let blocks = error_blocks(history);
    let recent = &history[history.len().saturating_sub(RECENT_WINDOW)..];
    let in_blocks: HashSet<u64> = blocks.iter().map(|e| e.id).collect();

    let divided = match (blocks.last(), recent.first()) {
        (Some(last_error), Some(first_recent)) => {
            (first_recent.timestamp - last_error.timestamp).num_milliseconds() > DIVIDER_GAP_MS
        }
        _ => false,
    };

    let tail: Vec<&LogEntry> = recent
        .iter()
        .filter(|e| !in_blocks.contains(&e.id))
        .collect();

    let mut lines = Vec::with_capacity(blocks.len() + tail.len() + 1);
    if divided {
        lines.extend(blocks.iter().map(|e| render_entry(e)));
        lines.push(RECENT_DIVIDER.to_string());
        lines.extend(tail.iter().map(|e| render_entry(e)));
    } else {
        let mut merged: Vec<&LogEntry> = blocks.into_iter().chain(tail).collect();
        merged.sort_by_key(|e| (e.timestamp, e.id));
        lines.extend(merged.iter().map(|e| render_entry(e)));
    }

    lines.join("\n")
}

/// Turn a plain log file into entries, one per non-empty line. Lines with
/// error wording are tagged [`LogLevel::Error`]; everything shares `timestamp`.
pub fn entries_from_text(text: &str, timestamp: DateTime<Utc>) -> Vec<LogEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let mut entry =
                LogEntry::new(i as u64 + 1, timestamp, LogSource::Stdout, LogLevel::Info, line);
            if is_error_indicating(&entry) {
                entry.level = LogLevel::Error;
            }
            entry
        })
        .collect()
}

/// `[HH:MM:SS] [LEVEL] content`
pub fn render_entry(entry: &LogEntry) -> String {
    format!(
        "[{}] [{}] {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.level.label(),
        entry.content
    )
}

fn error_blocks(history: &[LogEntry]) -> Vec<&LogEntry> {
    let mut blocks: Vec<&LogEntry> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut capturing = false;
    let mut trailing = 0usize;

    for (i, entry) in history.iter().enumerate() {
        if is_error_indicating(entry) {
            if !capturing {
                for ctx in &history[i.saturating_sub(LINES_BEFORE)..i] {
                    if seen.insert(ctx.id) {
                        blocks.push(ctx);
                    }
                }
            }
            capturing = true;
            trailing = 0;
            if seen.insert(entry.id) {
                blocks.push(entry);
            }
        } else if capturing {
            if trailing < LINES_AFTER {
                if seen.insert(entry.id) {
                    blocks.push(entry);
                }
                trailing += 1;
            } else {
                capturing = false;
                trailing = 0;
            }
        }
    }

    blocks.sort_by_key(|e| (e.timestamp, e.id));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
    }

    fn entry(id: u64, offset_ms: i64, level: LogLevel, content: &str) -> LogEntry {
        LogEntry::new(
            id,
            base() + Duration::milliseconds(offset_ms),
            LogSource::Stdout,
            level,
            content,
        )
    }

    fn info_lines(count: u64, start_id: u64, start_ms: i64) -> Vec<LogEntry> {
        (0..count)
            .map(|i| {
                entry(
                    start_id + i,
                    start_ms + i as i64,
                    LogLevel::Info,
                    &format!("line {}", start_id + i),
                )
            })
            .collect()
    }

    #[test]
    fn empty_history_returns_sentinel() {
        assert_eq!(select_for_analysis(&[]), "No logs captured.");
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert!(is_error_indicating(&entry(1, 0, LogLevel::Info, "TypeError: x")));
        assert!(is_error_indicating(&entry(1, 0, LogLevel::Info, "Build FAILED")));
        assert!(is_error_indicating(&entry(1, 0, LogLevel::Info, "FATAL: boom")));
        assert!(is_error_indicating(&entry(1, 0, LogLevel::Info, "Unhandled Exception")));
        assert!(is_error_indicating(&entry(1, 0, LogLevel::Error, "plain text")));
        assert!(!is_error_indicating(&entry(1, 0, LogLevel::Warn, "compiled ok")));
    }

    #[test]
    fn renders_time_level_and_content() {
        let e = entry(1, 0, LogLevel::Warn, "careful");
        assert_eq!(render_entry(&e), "[09:26:53] [WARN] careful");
    }

    #[test]
    fn short_history_is_rendered_in_order() {
        let history = info_lines(3, 1, 0);
        let out = select_for_analysis(&history);
        assert_eq!(
            out,
            "[09:26:53] [INFO] line 1\n[09:26:53] [INFO] line 2\n[09:26:53] [INFO] line 3"
        );
    }

    #[test]
    fn error_block_takes_five_before_and_twenty_after() {
        let mut history = info_lines(10, 1, 0);
        history.push(entry(11, 10, LogLevel::Error, "crash here"));
        history.extend(info_lines(30, 12, 11));

        let blocks = error_blocks(&history);
        let ids: Vec<u64> = blocks.iter().map(|e| e.id).collect();
        let expected: Vec<u64> = (6..=31).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn nearby_errors_extend_the_window() {
        let mut history = info_lines(2, 1, 0);
        history.push(entry(3, 2, LogLevel::Info, "error one"));
        history.extend(info_lines(10, 4, 3));
        history.push(entry(14, 13, LogLevel::Info, "error two"));
        history.extend(info_lines(25, 15, 14));

        let blocks = error_blocks(&history);
        let ids: Vec<u64> = blocks.iter().map(|e| e.id).collect();
        // leading context 1..2, both errors, everything between, 20 after the second
        let expected: Vec<u64> = (1..=34).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn old_errors_get_a_divider_before_recent_window() {
        let mut history = vec![entry(1, 0, LogLevel::Error, "early failure")];
        history.extend(info_lines(20, 2, 1));
        // 60 quiet lines five seconds later push the block out of the recent window
        history.extend(info_lines(60, 22, 5_000));

        let out = select_for_analysis(&history);
        assert!(out.contains("early failure"));
        assert!(out.contains("--- RECENT LOGS ---"));
        let divider_at = out.find("--- RECENT LOGS ---").unwrap();
        assert!(out.find("early failure").unwrap() < divider_at);
        assert!(out.find("line 81").unwrap() > divider_at);
        // the block's trailing context is not repeated after the divider
        assert_eq!(out.matches("] line 2\n").count(), 1);
    }

    #[test]
    fn close_errors_merge_chronologically() {
        let mut history = info_lines(60, 1, 0);
        history.insert(30, entry(100, 29, LogLevel::Error, "mid failure"));
        // keep timestamps ordered after the insert
        for (i, e) in history.iter_mut().enumerate() {
            e.timestamp = base() + Duration::milliseconds(i as i64);
        }

        let out = select_for_analysis(&history);
        assert!(!out.contains("RECENT LOGS"));
        let positions: Vec<usize> = ["line 25", "mid failure", "line 60"]
            .iter()
            .map(|needle| out.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn entries_are_never_duplicated() {
        let mut history = info_lines(5, 1, 0);
        history.push(entry(6, 5, LogLevel::Error, "boom"));
        history.extend(info_lines(5, 7, 6));

        let out = select_for_analysis(&history);
        for id in 1..=11 {
            let needle = if id == 6 {
                "boom".to_string()
            } else {
                format!("line {id}")
            };
            let count = out
                .lines()
                .filter(|l| l.ends_with(&format!("] {needle}")))
                .count();
            assert_eq!(count, 1, "{needle} appears {count} times in:\n{out}");
        }
    }

    #[test]
    fn plain_text_lines_become_entries() {
        let text = "starting\n\nTypeError: boom\n  at x.js:1\n";
        let entries = entries_from_text(text, base());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].content, "TypeError: boom");
        assert_eq!(entries[2].id, 3);
        assert!(select_for_analysis(&entries).contains("[ERROR] TypeError: boom"));
    }

    proptest! {
        #[test]
        fn error_entries_always_survive(
            flags in proptest::collection::vec(any::<bool>(), 1..300),
            gaps in proptest::collection::vec(0i64..2_000, 300),
        ) {
            let mut offset = 0;
            let history: Vec<LogEntry> = flags
                .iter()
                .enumerate()
                .map(|(i, is_err)| {
                    offset += gaps[i];
                    let id = i as u64 + 1;
                    if *is_err {
                        entry(id, offset, LogLevel::Error, &format!("#{id}#"))
                    } else {
                        entry(id, offset, LogLevel::Info, &format!("<{id}>"))
                    }
                })
                .collect();

            let out = select_for_analysis(&history);
            for e in history.iter().filter(|e| is_error_indicating(e)) {
                prop_assert!(out.contains(&e.content));
            }
        }
    }
}
