//! Control loop: the supervision state machine.
//!
//! A single task owns every piece of mutable state: phase, attempt counter,
//! log ring, readiness detector, timers and the process supervisor. Inputs
//! arrive on three channels and each is handled to completion before the
//! next one is looked at:
//!
//! ```text
//! ControlHandle ──commands──┐
//! supervisor ─────process───┼──► ControlLoop ──► Report sink
//! timers / diagnosis tasks ─┘
//! ```
//!
//! Diagnosis calls run in spawned tasks and post their verdict back with a
//! ticket. Starting or stopping a process aborts those tasks and bumps the
//! tickets, so a late verdict can never move the phase of a newer run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::detector::{ReadinessDetector, ReadinessSettings};
use crate::diagnosis::{Diagnoser, ReadinessVerdict, Verdict};
use crate::events::{Report, ReportSink};
use crate::evidence::{NO_LOGS_SENTINEL, select_for_analysis};
use crate::feedback;
use crate::log::{CaptureLimits, FlushSchedule, LogEntry, LogLevel, LogRing, LogSource};
use crate::supervisor::{ProcessControl, ProcessEvent, RunId, SpawnError};
use crate::timers::{TimerFire, TimerKind, TimerSet};

/// Where the supervised server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    /// Spawned; waiting for a readiness signal.
    Bootstrapping,
    /// Boot timeout passed without a readiness signal.
    Running,
    /// Readiness confirmed.
    Healthy,
    Analyzing,
    ErrorDetected,
    FeedbackSent,
    /// Terminal until attempts are reset.
    MaxRetriesReached,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Running => "running",
            Phase::Healthy => "healthy",
            Phase::Analyzing => "analyzing",
            Phase::ErrorDetected => "error_detected",
            Phase::FeedbackSent => "feedback_sent",
            Phase::MaxRetriesReached => "max_retries_reached",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain values the loop runs on, resolved from config upstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSettings {
    pub max_retries: u32,
    pub readiness_timeout: Duration,
    pub analysis_debounce: Duration,
    pub capture: CaptureLimits,
    pub readiness: ReadinessSettings,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            readiness_timeout: Duration::from_secs(60),
            analysis_debounce: Duration::from_secs(2),
            capture: CaptureLimits::default(),
            readiness: ReadinessSettings::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("retry limit reached ({attempts}/{max_retries}); reset attempts before starting again")]
    RetryLimit { attempts: u32, max_retries: u32 },
    #[error("no previous command to restart")]
    NoPreviousCommand,
    #[error("control loop is not running")]
    LoopClosed,
}

/// Point-in-time view of the loop's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub attempts: u32,
    pub max_retries: u32,
    pub running: bool,
    pub last_exit_code: Option<i32>,
    pub last_analysis: Option<Verdict>,
    pub log_entries: usize,
}

/// Outcome of an on-demand analysis of the current logs.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualAnalysis {
    NotConfigured,
    /// Nothing captured yet.
    NoLogs,
    Verdict(Verdict),
}

enum Command {
    Start {
        command: String,
        cwd: PathBuf,
        reply: oneshot::Sender<Result<RunId, ControlError>>,
    },
    Restart {
        reply: oneshot::Sender<Result<RunId, ControlError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ResetAttempts {
        reply: oneshot::Sender<()>,
    },
    ClearLogs {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    History {
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Excerpt {
        reply: oneshot::Sender<String>,
    },
    AnalyzeNow {
        reply: oneshot::Sender<ManualAnalysis>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Inputs the loop produces for itself.
enum LoopEvent {
    Timer(TimerFire),
    AnalysisDone { ticket: u64, verdict: Verdict },
    ReadinessDone { ticket: u64, verdict: ReadinessVerdict },
}

impl From<TimerFire> for LoopEvent {
    fn from(fire: TimerFire) -> Self {
        LoopEvent::Timer(fire)
    }
}

struct InFlight {
    ticket: u64,
    handle: JoinHandle<()>,
}

/// Cloneable handle for driving a running control loop.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ControlError::LoopClosed)?;
        rx.await.map_err(|_| ControlError::LoopClosed)
    }

    /// Start `command` in `cwd`, replacing any running process.
    pub async fn start_process(
        &self,
        command: impl Into<String>,
        cwd: impl AsRef<Path>,
    ) -> Result<RunId, ControlError> {
        let command = command.into();
        let cwd = cwd.as_ref().to_path_buf();
        self.request(|reply| Command::Start {
            command,
            cwd,
            reply,
        })
        .await?
    }

    /// Stop, then start the last command again with a fresh attempt budget.
    pub async fn restart_process(&self) -> Result<RunId, ControlError> {
        self.request(|reply| Command::Restart { reply }).await?
    }

    /// Stop the process and reset the attempt counter.
    pub async fn stop_process(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn reset_attempts(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::ResetAttempts { reply }).await
    }

    pub async fn clear_logs(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::ClearLogs { reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ControlError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn phase(&self) -> Result<Phase, ControlError> {
        Ok(self.status().await?.phase)
    }

    pub async fn attempts(&self) -> Result<u32, ControlError> {
        Ok(self.status().await?.attempts)
    }

    pub async fn last_analysis(&self) -> Result<Option<Verdict>, ControlError> {
        Ok(self.status().await?.last_analysis)
    }

    /// Retained log history, oldest first.
    pub async fn history(&self) -> Result<Vec<LogEntry>, ControlError> {
        self.request(|reply| Command::History { reply }).await
    }

    /// The excerpt diagnosis would be given right now.
    pub async fn excerpt(&self) -> Result<String, ControlError> {
        self.request(|reply| Command::Excerpt { reply }).await
    }

    /// Diagnose the current logs without touching phase or attempts.
    pub async fn analyze_now(&self) -> Result<ManualAnalysis, ControlError> {
        self.request(|reply| Command::AnalyzeNow { reply }).await
    }

    /// Stop the process, flush pending logs and end the loop.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct ControlLoop {
    settings: ControlSettings,
    diagnoser: Diagnoser,
    process: Box<dyn ProcessControl>,
    sink: ReportSink,
    internal_tx: mpsc::UnboundedSender<LoopEvent>,
    timers: TimerSet<LoopEvent>,
    ring: LogRing,
    detector: ReadinessDetector,
    phase: Phase,
    attempts: u32,
    current_run: Option<RunId>,
    last_exit_code: Option<i32>,
    last_command: Option<(String, PathBuf)>,
    last_analysis: Option<Verdict>,
    analysis: Option<InFlight>,
    readiness_check: Option<InFlight>,
    next_ticket: u64,
}

impl ControlLoop {
    /// Spawn the loop on the current runtime.
    ///
    /// `process_events` must be the receiver paired with `process`.
    pub fn spawn(
        settings: ControlSettings,
        diagnoser: Diagnoser,
        process: Box<dyn ProcessControl>,
        process_events: mpsc::UnboundedReceiver<ProcessEvent>,
        sink: ReportSink,
    ) -> (ControlHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let mut ring = LogRing::new(settings.capture);
        let batch_sink = sink.clone();
        ring.set_listener(move |batch| {
            let _ = batch_sink.send(Report::log_batch(batch));
        });

        let control = ControlLoop {
            settings,
            diagnoser,
            process,
            sink,
            timers: TimerSet::new(internal_tx.clone()),
            internal_tx,
            ring,
            detector: ReadinessDetector::new(settings.readiness),
            phase: Phase::Idle,
            attempts: 0,
            current_run: None,
            last_exit_code: None,
            last_command: None,
            last_analysis: None,
            analysis: None,
            readiness_check: None,
            next_ticket: 1,
        };

        let task = tokio::spawn(control.run(command_rx, internal_rx, process_events));
        (ControlHandle { tx: command_tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<LoopEvent>,
        mut process_events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        info!(max_retries = self.settings.max_retries, "control loop started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // every handle dropped
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                Some(event) = process_events.recv() => self.handle_process(event),
            }
        }
        info!("control loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                command,
                cwd,
                reply,
            } => {
                let result = self.start_process(command, cwd).await;
                let _ = reply.send(result);
            }
            Command::Restart { reply } => {
                let result = match self.last_command.clone() {
                    Some((command, cwd)) => {
                        self.stop_process().await;
                        self.log(
                            LogSource::System,
                            "Restarting process".to_string(),
                            LogLevel::Info,
                        );
                        self.start_process(command, cwd).await
                    }
                    None => Err(ControlError::NoPreviousCommand),
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop_process().await;
                let _ = reply.send(());
            }
            Command::ResetAttempts { reply } => {
                self.reset_attempts();
                let _ = reply.send(());
            }
            Command::ClearLogs { reply } => {
                self.ring.clear();
                self.timers.cancel(TimerKind::LogFlush);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::History { reply } => {
                let _ = reply.send(self.ring.snapshot());
            }
            Command::Excerpt { reply } => {
                let _ = reply.send(select_for_analysis(&self.ring.snapshot()));
            }
            Command::AnalyzeNow { reply } => self.analyze_now(reply),
            Command::Shutdown { reply } => {
                // handled in run()
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Timer(fire) => {
                if !self.timers.accept(fire) {
                    return;
                }
                match fire.kind {
                    TimerKind::LogFlush => {
                        self.ring.flush();
                    }
                    TimerKind::Readiness => self.on_readiness_timeout(),
                    TimerKind::AnalysisDebounce => self.on_debounce_elapsed(),
                }
            }
            LoopEvent::AnalysisDone { ticket, verdict } => self.on_analysis(ticket, verdict),
            LoopEvent::ReadinessDone { ticket, verdict } => self.on_readiness(ticket, verdict),
        }
    }

    fn handle_process(&mut self, event: ProcessEvent) {
        if Some(event.run()) != self.current_run {
            trace!(run = event.run(), "event from a replaced process ignored");
            return;
        }
        match event {
            ProcessEvent::Stdout { chunk, .. } => {
                if self.phase == Phase::Bootstrapping {
                    self.observe_boot_output(&chunk);
                }
                self.log(LogSource::Stdout, chunk, LogLevel::Info);
            }
            ProcessEvent::Stderr { chunk, .. } => {
                self.log(LogSource::Stderr, chunk, LogLevel::Error);
            }
            ProcessEvent::Exited { code, .. } => self.on_exit(code),
        }
    }

    // --- commands ---

    async fn start_process(&mut self, command: String, cwd: PathBuf) -> Result<RunId, ControlError> {
        if self.phase == Phase::MaxRetriesReached && self.attempts >= self.settings.max_retries {
            warn!(attempts = self.attempts, "start refused at retry limit");
            return Err(ControlError::RetryLimit {
                attempts: self.attempts,
                max_retries: self.settings.max_retries,
            });
        }

        self.cancel_pending();
        self.current_run = None;
        self.attempts += 1;
        self.last_analysis = None;
        self.detector.reset();
        self.last_command = Some((command.clone(), cwd.clone()));
        self.set_phase(Phase::Starting);
        self.log(
            LogSource::System,
            format!(
                "Starting `{command}` in {} (attempt {}/{})",
                cwd.display(),
                self.attempts,
                self.settings.max_retries
            ),
            LogLevel::Info,
        );

        match self.process.start(&command, &cwd).await {
            Ok(run) => {
                self.current_run = Some(run);
                self.set_phase(Phase::Bootstrapping);
                self.timers
                    .arm(TimerKind::Readiness, self.settings.readiness_timeout);
                Ok(run)
            }
            Err(e) => {
                warn!(error = %e, "spawn failed");
                self.log(
                    LogSource::System,
                    format!("Failed to start process: {e}"),
                    LogLevel::Error,
                );
                self.set_phase(Phase::ErrorDetected);
                self.at_retry_limit();
                Err(e.into())
            }
        }
    }

    async fn stop_process(&mut self) {
        self.cancel_pending();
        let was_running = self.current_run.take().is_some() || self.process.is_running();
        self.process.stop().await;
        self.detector.abandon();
        self.attempts = 0;
        if was_running {
            self.log(LogSource::System, "Process stopped".to_string(), LogLevel::Info);
        }
        self.set_phase(Phase::Idle);
    }

    fn reset_attempts(&mut self) {
        info!(previous = self.attempts, "attempt counter reset");
        self.attempts = 0;
        if self.phase == Phase::MaxRetriesReached {
            self.set_phase(Phase::Idle);
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_pending();
        self.current_run = None;
        self.process.stop().await;
        self.timers.cancel_all();
        self.ring.shutdown();
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            attempts: self.attempts,
            max_retries: self.settings.max_retries,
            running: self.process.is_running(),
            last_exit_code: self.last_exit_code,
            last_analysis: self.last_analysis.clone(),
            log_entries: self.ring.len(),
        }
    }

    // --- process lifecycle ---

    fn on_exit(&mut self, code: Option<i32>) {
        self.current_run = None;
        self.last_exit_code = code;
        self.timers.cancel(TimerKind::Readiness);
        abort(&mut self.readiness_check);
        self.detector.abandon();

        let (label, level) = match code {
            Some(0) => ("0".to_string(), LogLevel::Info),
            Some(c) => (c.to_string(), LogLevel::Error),
            None => ("null".to_string(), LogLevel::Warn),
        };
        self.log(
            LogSource::System,
            format!("Process exited with code {label}"),
            level,
        );

        match code {
            Some(c) if c != 0 => self.handle_crash(),
            _ => self.set_phase(Phase::Idle),
        }
    }

    fn handle_crash(&mut self) {
        if self.at_retry_limit() {
            return;
        }
        debug!(delay = ?self.settings.analysis_debounce, "crash; analysis debounced");
        self.timers
            .arm(TimerKind::AnalysisDebounce, self.settings.analysis_debounce);
    }

    /// Enter the terminal phase if the attempt budget is spent.
    fn at_retry_limit(&mut self) -> bool {
        if self.attempts < self.settings.max_retries {
            return false;
        }
        self.timers.cancel(TimerKind::AnalysisDebounce);
        if self.phase != Phase::MaxRetriesReached {
            warn!(attempts = self.attempts, "max retries reached");
            self.log(
                LogSource::System,
                format!(
                    "Max retries reached ({}/{}); manual intervention required",
                    self.attempts, self.settings.max_retries
                ),
                LogLevel::Error,
            );
            self.set_phase(Phase::MaxRetriesReached);
        }
        true
    }

    // --- analysis ---

    fn on_debounce_elapsed(&mut self) {
        if self.at_retry_limit() {
            return;
        }

        self.set_phase(Phase::Analyzing);
        let excerpt = select_for_analysis(&self.ring.snapshot());

        if excerpt == NO_LOGS_SENTINEL {
            self.log(
                LogSource::System,
                "No logs captured; nothing to analyze".to_string(),
                LogLevel::Warn,
            );
            self.set_phase(Phase::Idle);
            return;
        }

        if !self.diagnoser.is_configured() {
            let text = feedback::unconfigured_feedback(self.last_exit_code, &excerpt);
            self.log(LogSource::System, text, LogLevel::Warn);
            self.set_phase(Phase::ErrorDetected);
            return;
        }

        let ticket = self.ticket();
        let diagnoser = self.diagnoser.clone();
        let tx = self.internal_tx.clone();
        info!(
            ticket,
            backend = diagnoser.backend_name(),
            excerpt_len = excerpt.len(),
            "analysis requested"
        );
        let handle = tokio::spawn(async move {
            let verdict = diagnoser.analyze(&excerpt).await;
            let _ = tx.send(LoopEvent::AnalysisDone { ticket, verdict });
        });
        self.analysis = Some(InFlight { ticket, handle });
    }

    fn analyze_now(&mut self, reply: oneshot::Sender<ManualAnalysis>) {
        if !self.diagnoser.is_configured() {
            let _ = reply.send(ManualAnalysis::NotConfigured);
            return;
        }
        let excerpt = select_for_analysis(&self.ring.snapshot());
        if excerpt == NO_LOGS_SENTINEL {
            let _ = reply.send(ManualAnalysis::NoLogs);
            return;
        }

        let diagnoser = self.diagnoser.clone();
        info!(excerpt_len = excerpt.len(), "manual analysis requested");
        tokio::spawn(async move {
            let verdict = diagnoser.analyze(&excerpt).await;
            let _ = reply.send(ManualAnalysis::Verdict(verdict));
        });
    }

    fn on_analysis(&mut self, ticket: u64, verdict: Verdict) {
        if !matches!(&self.analysis, Some(f) if f.ticket == ticket) {
            trace!(ticket, "stale analysis result ignored");
            return;
        }
        self.analysis = None;
        self.last_analysis = Some(verdict.clone());

        if verdict.has_error {
            self.set_phase(Phase::ErrorDetected);
            let text = feedback::analysis_feedback(&verdict, self.attempts, self.settings.max_retries);
            self.log(LogSource::Diagnosis, text.clone(), LogLevel::Error);
            let _ = self.sink.send(Report::analysis(
                verdict,
                self.attempts,
                self.settings.max_retries,
                text,
            ));
            self.set_phase(Phase::FeedbackSent);
        } else {
            if let Some(message) = verdict.error_message.as_deref() {
                self.log(LogSource::Diagnosis, message.to_string(), LogLevel::Warn);
            }
            self.log(
                LogSource::System,
                feedback::clean_exit_notice(self.last_exit_code),
                LogLevel::Info,
            );
            self.set_phase(Phase::Idle);
        }
    }

    // --- readiness ---

    fn observe_boot_output(&mut self, chunk: &str) {
        let Some(excerpt) = self.detector.observe(chunk, Instant::now()) else {
            return;
        };
        if self.readiness_check.is_some() {
            debug!("readiness check already in flight");
            return;
        }

        let ticket = self.ticket();
        let diagnoser = self.diagnoser.clone();
        let tx = self.internal_tx.clone();
        debug!(ticket, "readiness check requested");
        let handle = tokio::spawn(async move {
            let verdict = diagnoser.check_readiness(&excerpt).await;
            let _ = tx.send(LoopEvent::ReadinessDone { ticket, verdict });
        });
        self.readiness_check = Some(InFlight { ticket, handle });
    }

    fn on_readiness(&mut self, ticket: u64, verdict: ReadinessVerdict) {
        if !matches!(&self.readiness_check, Some(f) if f.ticket == ticket) {
            trace!(ticket, "stale readiness result ignored");
            return;
        }
        self.readiness_check = None;
        if self.phase != Phase::Bootstrapping {
            return;
        }
        let Some(signal) = self.detector.accept(&verdict) else {
            return;
        };

        self.timers.cancel(TimerKind::Readiness);
        self.set_phase(Phase::Healthy);
        let at = signal.url.clone().unwrap_or_else(|| match signal.port {
            Some(port) => format!("localhost:{port}"),
            None => "localhost".to_string(),
        });
        info!(url = %at, "server ready");
        self.log(
            LogSource::Diagnosis,
            format!("Server ready at {at}"),
            LogLevel::Info,
        );
        let _ = self.sink.send(Report::ready(signal.url, signal.port));
    }

    fn on_readiness_timeout(&mut self) {
        if self.phase != Phase::Bootstrapping {
            return;
        }
        self.detector.abandon();
        abort(&mut self.readiness_check);
        self.set_phase(Phase::Running);
        self.log(
            LogSource::System,
            format!(
                "No readiness signal after {}s; assuming the server is running",
                self.settings.readiness_timeout.as_secs()
            ),
            LogLevel::Warn,
        );
        let _ = self.sink.send(Report::degraded());
    }

    // --- plumbing ---

    fn log(&mut self, source: LogSource, content: String, level: LogLevel) {
        match self.ring.append(source, content, level) {
            FlushSchedule::Flushed => {
                self.timers.cancel(TimerKind::LogFlush);
            }
            FlushSchedule::ArmTimer(delay) => {
                self.timers.arm(TimerKind::LogFlush, delay);
            }
            FlushSchedule::Pending => {}
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        info!(from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
        let _ = self.sink.send(Report::phase_changed(phase));
    }

    /// Every start and stop passes through here, so at most one crash
    /// analysis is ever in flight.
    fn cancel_pending(&mut self) {
        self.timers.cancel(TimerKind::Readiness);
        self.timers.cancel(TimerKind::AnalysisDebounce);
        abort(&mut self.analysis);
        abort(&mut self.readiness_check);
    }

    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

fn abort(slot: &mut Option<InFlight>) {
    if let Some(in_flight) = slot.take() {
        in_flight.handle.abort();
    }
}
