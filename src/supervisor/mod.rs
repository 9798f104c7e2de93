//! Process supervision: one dev-server child at a time.
//!
//! Spawns the command through the platform shell in its own process group,
//! streams stdout and stderr as raw chunks, and reports exactly one exit per
//! run. Every event is tagged with the [`RunId`] of the run that produced it
//! so consumers can drop output from a process they already replaced.
//!
//! ```text
//! start ──► reader(stdout) ─┐
//!       ──► reader(stderr) ─┼─► ProcessEvent channel
//!       ──► waiter ─────────┘   (Exited sent after readers drain)
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifies one spawned process; increases with every start.
pub type RunId = u64;

/// How long the waiter lets readers drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 4096;

/// Output and lifecycle events from a supervised process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout { run: RunId, chunk: String },
    Stderr { run: RunId, chunk: String },
    /// Fires once per run. `code` is `None` when the process died from a signal.
    Exited { run: RunId, code: Option<i32> },
}

impl ProcessEvent {
    pub fn run(&self) -> RunId {
        match self {
            ProcessEvent::Stdout { run, .. }
            | ProcessEvent::Stderr { run, .. }
            | ProcessEvent::Exited { run, .. } => *run,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to spawn `{command}` in {}: {source}", cwd.display())]
pub struct SpawnError {
    pub command: String,
    pub cwd: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The operations the control loop needs from a process supervisor.
#[async_trait]
pub trait ProcessControl: Send {
    /// Start `command` in `cwd`, stopping any active process first.
    async fn start(&mut self, command: &str, cwd: &Path) -> Result<RunId, SpawnError>;

    /// Terminate the active process group and wait for it to exit.
    /// No-op without an active process.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorSettings {
    /// Time between the graceful signal and the force-kill.
    pub stop_grace: Duration,
    /// Set `FORCE_COLOR=true` in the child environment.
    pub force_color: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
            force_color: true,
        }
    }
}

struct ActiveRun {
    run: RunId,
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    waiter: JoinHandle<()>,
}

/// Supervises real OS processes.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    events: mpsc::UnboundedSender<ProcessEvent>,
    active: Option<ActiveRun>,
    next_run: RunId,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiver its events arrive on.
    pub fn new(settings: SupervisorSettings) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            settings,
            events,
            active: None,
            next_run: 1,
        };
        (supervisor, rx)
    }

    fn shell_command(&self, command: &str, cwd: &Path) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            // own group so stop() reaches grandchildren spawned by the shell
            cmd.process_group(0);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };

        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.settings.force_color {
            cmd.env("FORCE_COLOR", "true");
        }
        cmd
    }

    async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
        tokio::time::timeout(limit, exited.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn start(&mut self, command: &str, cwd: &Path) -> Result<RunId, SpawnError> {
        if self.active.is_some() {
            self.stop().await;
        }

        let mut child = self
            .shell_command(command, cwd)
            .spawn()
            .map_err(|source| SpawnError {
                command: command.to_string(),
                cwd: cwd.to_path_buf(),
                source,
            })?;

        let run = self.next_run;
        self.next_run += 1;
        let pid = child.id();
        info!(run, pid, command, cwd = %cwd.display(), "process spawned");

        let stdout = child.stdout.take().map(|out| {
            spawn_reader(out, self.events.clone(), move |chunk| ProcessEvent::Stdout {
                run,
                chunk,
            })
        });
        let stderr = child.stderr.take().map(|err| {
            spawn_reader(err, self.events.clone(), move |chunk| ProcessEvent::Stderr {
                run,
                chunk,
            })
        });

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        let events = self.events.clone();
        let waiter = tokio::spawn(async move {
            let code = wait_child(&mut child, kill_rx).await;
            for reader in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!(run, "output reader still open after exit");
                }
            }
            info!(run, ?code, "process exited");
            let _ = events.send(ProcessEvent::Exited { run, code });
            let _ = exited_tx.send(true);
        });

        self.active = Some(ActiveRun {
            run,
            pid,
            exited: exited_rx,
            kill_tx: Some(kill_tx),
            waiter,
        });
        Ok(run)
    }

    async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if *active.exited.borrow() {
            return;
        }

        info!(run = active.run, pid = active.pid, "stopping process");
        let grace = self.settings.stop_grace;

        #[cfg(unix)]
        {
            if let Some(pid) = active.pid {
                signal_group(pid, libc::SIGTERM);
            }
            if !Self::wait_exited(&mut active.exited, grace).await {
                warn!(run = active.run, "process ignored SIGTERM; killing");
                if let Some(pid) = active.pid {
                    signal_group(pid, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Some(kill) = active.kill_tx.take() {
                let _ = kill.send(());
            }
        }

        if !Self::wait_exited(&mut active.exited, grace).await {
            // last resort: let the waiter kill the direct child
            if let Some(kill) = active.kill_tx.take() {
                let _ = kill.send(());
            }
            if !Self::wait_exited(&mut active.exited, grace).await {
                warn!(run = active.run, "process did not exit after kill; detaching");
                active.waiter.abort();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !*active.exited.borrow())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // kill_on_drop only reaches the shell; take the whole group down
        #[cfg(unix)]
        {
            if let Some(active) = &self.active {
                if let Some(pid) = active.pid.filter(|_| !*active.exited.borrow()) {
                    signal_group(pid, libc::SIGKILL);
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group created
    // by process_group(0); it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(pgid, signal, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

async fn wait_child(child: &mut Child, mut kill_rx: oneshot::Receiver<()>) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed to wait for child");
            None
        }
    }
}

fn spawn_reader<R, F>(
    mut stream: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
    wrap: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(String) -> ProcessEvent + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut carry = Vec::new();
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("read error (process likely exited): {e}");
                    break;
                }
            };
            let text = decode_chunk(&mut carry, &buf[..n]);
            if !text.is_empty() && events.send(wrap(text)).is_err() {
                break;
            }
        }
        if !carry.is_empty() {
            let _ = events.send(wrap(String::from_utf8_lossy(&carry).into_owned()));
        }
    })
}

/// Decode `bytes` appended to `carry`, holding back an incomplete trailing
/// UTF-8 sequence for the next read. Invalid bytes become U+FFFD.
pub fn decode_chunk(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let keep_from = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => carry.len(),
    };
    let rest = carry.split_off(keep_from);
    let text = String::from_utf8_lossy(carry).into_owned();
    *carry = rest;
    text
}
