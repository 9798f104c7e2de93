//! Interactive `devwarden run` session.
//!
//! Wires the supervisor, diagnosis backend and control loop together, prints
//! reports as they arrive, records them in the session journal, and turns
//! stdin lines into control commands until `quit` or Ctrl-C.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{CONFIG_DIR, ProjectConfig};
use crate::control::{
    ControlError, ControlHandle, ControlLoop, ControlSettings, ManualAnalysis, StatusSnapshot,
};
use crate::diagnosis::{Diagnoser, backend_from_settings};
use crate::events::{Report, ReportKind};
use crate::feedback;
use crate::log::journal::Journal;
use crate::log::{LogEntry, LogSource};
use crate::supervisor::ProcessSupervisor;

const TAG: &str = "\x1b[36m[devwarden]\x1b[0m";

/// A line typed into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Start the given command, or the session's command when `None`.
    Start(Option<String>),
    Stop,
    Restart,
    Reset,
    Clear,
    /// Diagnose the current logs on demand.
    Analyze,
    Status,
    Help,
    Quit,
}

/// Parse one stdin line. Blank lines yield `None`; unknown words are errors.
pub fn parse_input(line: &str) -> Option<Result<Input, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let input = match word.to_ascii_lowercase().as_str() {
        "start" | "s" if rest.is_empty() => Input::Start(None),
        "start" | "s" => Input::Start(Some(rest.to_string())),
        "stop" => Input::Stop,
        "restart" | "r" => Input::Restart,
        "reset" => Input::Reset,
        "clear" => Input::Clear,
        "analyze" | "a" => Input::Analyze,
        "status" | "st" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        other => return Some(Err(format!("unknown command '{other}' (try 'help')"))),
    };
    Some(Ok(input))
}

const HELP: &str =
    "commands: start [cmd] | stop | restart | reset | clear | analyze | status | quit";

/// Options for a session, resolved from CLI flags and config.
pub struct SessionOptions {
    pub command: String,
    pub cwd: PathBuf,
    pub json: bool,
    pub journal_dir: Option<PathBuf>,
}

impl SessionOptions {
    pub fn journal_dir_for(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_DIR).join("logs")
    }
}

/// Human-readable rendering of a report; `None` for reports whose content
/// already reaches the terminal through log entries.
pub fn render_report(report: &Report) -> Option<String> {
    match &report.kind {
        ReportKind::LogBatch { .. } | ReportKind::Readiness { .. } => None,
        ReportKind::Analysis { feedback, .. } => Some(format!("{TAG} {report}\n{feedback}")),
        _ => Some(format!("{TAG} {report}")),
    }
}

/// Phase line, the excerpt diagnosis would see, and the last verdict.
pub fn render_status(status: &StatusSnapshot, excerpt: &str) -> String {
    let exit = status
        .last_exit_code
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    let analysis = status
        .last_analysis
        .as_ref()
        .and_then(|v| serde_json::to_string_pretty(v).ok())
        .unwrap_or_else(|| "No analysis performed yet.".to_string());
    format!(
        "{TAG} phase={} attempts={}/{} running={} last_exit={} logs={}\n\
         === SELECTED LOGS ===\n{excerpt}\n\
         === LAST ANALYSIS ===\n{analysis}",
        status.phase,
        status.attempts,
        status.max_retries,
        status.running,
        exit,
        status.log_entries
    )
}

pub fn render_manual_analysis(outcome: &ManualAnalysis) -> String {
    match outcome {
        ManualAnalysis::NotConfigured => format!(
            "{TAG} diagnosis is not configured (set [diagnosis] in .devwarden/config.toml)"
        ),
        ManualAnalysis::NoLogs => format!("{TAG} no logs to analyze"),
        ManualAnalysis::Verdict(verdict) => {
            let body = serde_json::to_string_pretty(verdict)
                .unwrap_or_else(|_| feedback::headline(verdict));
            let summary = if verdict.has_error {
                feedback::headline(verdict)
            } else {
                "no errors found.".to_string()
            };
            format!("{TAG} analysis: {summary}\n{body}")
        }
    }
}

fn print_entry(entry: &LogEntry) {
    match entry.source {
        LogSource::Stdout => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(entry.content.as_bytes());
            let _ = out.flush();
        }
        LogSource::Stderr => {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(entry.content.as_bytes());
            let _ = err.flush();
        }
        // analysis feedback is printed with its report
        LogSource::Diagnosis if entry.content.starts_with("Error Detected") => {}
        LogSource::System | LogSource::Diagnosis | LogSource::Ide => {
            eprintln!("{TAG} {}", entry.content);
        }
    }
}

async fn print_reports(
    mut reports: mpsc::UnboundedReceiver<Report>,
    journal: Option<Journal>,
    json: bool,
) {
    while let Some(report) = reports.recv().await {
        if let Some(journal) = &journal {
            if let Err(e) = journal.record(&report) {
                warn!(error = %e, "journal write failed");
            }
        }
        if json {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialize report"),
            }
            continue;
        }
        match &report.kind {
            ReportKind::LogBatch { entries } => entries.iter().for_each(print_entry),
            _ => {
                if let Some(text) = render_report(&report) {
                    eprintln!("{text}");
                }
            }
        }
    }
}

async fn execute(
    handle: &ControlHandle,
    input: Input,
    options: &SessionOptions,
) -> Result<bool, ControlError> {
    match input {
        Input::Start(command) => {
            let command = command.unwrap_or_else(|| options.command.clone());
            handle.start_process(command, &options.cwd).await?;
        }
        Input::Stop => handle.stop_process().await?,
        Input::Restart => {
            handle.restart_process().await?;
        }
        Input::Reset => handle.reset_attempts().await?,
        Input::Clear => handle.clear_logs().await?,
        Input::Analyze => {
            eprintln!("{TAG} analyzing current logs...");
            let outcome = handle.analyze_now().await?;
            eprintln!("{}", render_manual_analysis(&outcome));
        }
        Input::Status => {
            let status = handle.status().await?;
            let excerpt = handle.excerpt().await?;
            eprintln!("{}", render_status(&status, &excerpt));
        }
        Input::Help => eprintln!("{TAG} {HELP}"),
        Input::Quit => return Ok(false),
    }
    Ok(true)
}

/// Run an interactive session until `quit`, end of input, or Ctrl-C.
pub async fn run(config: &ProjectConfig, settings: ControlSettings, options: SessionOptions) -> Result<()> {
    let backend = backend_from_settings(&config.diagnosis);
    if !backend.is_configured() {
        warn!(backend = backend.name(), "diagnosis unavailable; crashes will show raw logs");
    }
    let diagnoser = Diagnoser::new(backend, config.retry_policy());
    let (supervisor, process_events) = ProcessSupervisor::new(config.supervisor_settings());

    let journal = match &options.journal_dir {
        Some(dir) => {
            let journal = Journal::new(&Journal::session_path(dir))?;
            info!(path = %journal.path().display(), "session journal");
            Some(journal)
        }
        None => None,
    };

    let (sink, reports) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_reports(reports, journal, options.json));
    let (handle, control_task) =
        ControlLoop::spawn(settings, diagnoser, Box::new(supervisor), process_events, sink);

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    eprintln!(
        "{TAG} running `{}` in {}",
        options.command,
        options.cwd.display()
    );
    eprintln!("{TAG} {HELP}");
    if let Err(e) = handle.start_process(&options.command, &options.cwd).await {
        eprintln!("{TAG} {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin closed; keep supervising until Ctrl-C
                    Ok(None) => {
                        if interrupt_rx.recv().await.is_some() {
                            eprintln!("{TAG} interrupted");
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        break;
                    }
                };
                match parse_input(&line) {
                    None => continue,
                    Some(Err(message)) => eprintln!("{TAG} {message}"),
                    Some(Ok(input)) => match execute(&handle, input, &options).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(ControlError::LoopClosed) => break,
                        Err(e) => eprintln!("{TAG} {e}"),
                    },
                }
            }
            _ = interrupt_rx.recv() => {
                eprintln!("{TAG} interrupted");
                break;
            }
        }
    }

    handle.shutdown().await.ok();
    drop(handle);
    control_task.await.context("control loop panicked")?;
    printer.await.context("report printer panicked")?;
    Ok(())
}
