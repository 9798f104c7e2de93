//! Human-readable feedback blocks built from diagnosis verdicts.

use crate::diagnosis::Verdict;

/// Characters of evidence shown when diagnosis is unavailable.
pub const FALLBACK_EVIDENCE_CHARS: usize = 2000;

/// Format a positive verdict for the developer (and any coding assistant
/// reading the log). Empty fields are omitted.
pub fn analysis_feedback(verdict: &Verdict, attempt: u32, max_retries: u32) -> String {
    let mut lines = vec![
        format!("Error Detected (Attempt {attempt}/{max_retries})"),
        String::new(),
        format!("Type: {}", verdict.error_type.as_deref().unwrap_or("unknown")),
        format!(
            "Message: {}",
            verdict.error_message.as_deref().unwrap_or("No message")
        ),
    ];

    if let Some(file) = verdict.affected_file.as_deref().filter(|f| !f.is_empty()) {
        match verdict.line {
            Some(line) if line > 0 => lines.push(format!("File: {file}:{line}")),
            _ => lines.push(format!("File: {file}")),
        }
    }
    if let Some(cause) = verdict.cause.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("Cause: {cause}"));
    }
    if let Some(fix) = verdict.fix.as_deref().filter(|f| !f.is_empty()) {
        lines.push(format!("Suggested Fix: {fix}"));
    }

    lines.join("\n")
}

/// Feedback for a crash that could not be diagnosed because no backend is
/// configured: the raw evidence instead of a verdict.
pub fn unconfigured_feedback(exit_code: Option<i32>, evidence: &str) -> String {
    let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    // the head of the excerpt holds the error blocks
    let shown = match evidence.char_indices().nth(FALLBACK_EVIDENCE_CHARS) {
        Some((idx, _)) => &evidence[..idx],
        None => evidence,
    };
    [
        format!("Process exited with code {code}"),
        String::new(),
        "Diagnosis is not configured (set [diagnosis] in .devwarden/config.toml).".to_string(),
        "Here are the relevant logs:".to_string(),
        String::new(),
        shown.to_string(),
    ]
    .join("\n")
}

/// Single-line notice for a non-zero exit the backend found nothing wrong with.
pub fn clean_exit_notice(exit_code: Option<i32>) -> String {
    let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    format!("Process exited (code {code}) but no errors detected by diagnosis.")
}

/// Short form for terminal notifications.
pub fn headline(verdict: &Verdict) -> String {
    let kind = verdict.error_type.as_deref().unwrap_or("Error");
    match verdict.fix.as_deref() {
        Some(fix) if !fix.is_empty() => {
            let fix: String = fix.chars().take(80).collect();
            format!("{kind} detected. Fix: {fix}")
        }
        _ => format!("{kind} detected."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict() -> Verdict {
        Verdict {
            has_error: true,
            error_type: Some("module_not_found".into()),
            error_message: Some("Cannot find module 'expresss'".into()),
            affected_file: Some("server.js".into()),
            line: Some(3),
            cause: Some("Typo in the import".into()),
            fix: Some("Import 'express' instead".into()),
        }
    }

    #[test]
    fn full_feedback_block() {
        let text = analysis_feedback(&verdict(), 2, 5);
        assert_eq!(
            text,
            "Error Detected (Attempt 2/5)\n\n\
             Type: module_not_found\n\
             Message: Cannot find module 'expresss'\n\
             File: server.js:3\n\
             Cause: Typo in the import\n\
             Suggested Fix: Import 'express' instead"
        );
    }

    #[test]
    fn missing_fields_are_omitted_or_defaulted() {
        let v = Verdict {
            has_error: true,
            error_message: None,
            ..Verdict::fallback("")
        };
        let text = analysis_feedback(&v, 1, 3);
        assert!(text.contains("Type: unknown"));
        assert!(text.contains("Message: No message"));
        assert!(!text.contains("File:"));
        assert!(!text.contains("Cause:"));
        assert!(!text.contains("Suggested Fix:"));
    }

    #[test]
    fn file_without_line() {
        let v = Verdict {
            line: None,
            ..verdict()
        };
        assert!(analysis_feedback(&v, 1, 3).contains("File: server.js\n"));
    }

    #[test]
    fn unconfigured_feedback_truncates_evidence() {
        let evidence = "x".repeat(5000);
        let text = unconfigured_feedback(Some(1), &evidence);
        assert!(text.starts_with("Process exited with code 1"));
        assert!(text.contains("not configured"));
        assert!(text.ends_with(&format!("\n{}", "x".repeat(FALLBACK_EVIDENCE_CHARS))));
        assert!(!text.contains(&"x".repeat(FALLBACK_EVIDENCE_CHARS + 1)));
    }

    #[test]
    fn clean_exit_notice_names_code() {
        assert_eq!(
            clean_exit_notice(Some(2)),
            "Process exited (code 2) but no errors detected by diagnosis."
        );
    }

    #[test]
    fn headline_truncates_fix() {
        let v = Verdict {
            fix: Some("f".repeat(200)),
            ..verdict()
        };
        let line = headline(&v);
        let fix = line.strip_prefix("module_not_found detected. Fix: ").unwrap();
        assert_eq!(fix.len(), 80);
        assert_eq!(headline(&Verdict::fallback("x")), "Error detected.");
    }
}
