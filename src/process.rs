//! External process wrapper used by the relay pipeline and the local player.
//!
//! Each [`ExternalProcess`] owns one spawned child. Two background tasks
//! are attached on start:
//!
//! - a **waiter** that owns the child, reaps it on exit, and performs kills
//!   requested through [`ProcessHandle::kill`];
//! - a **diagnostic reader** that forwards stderr lines to the log and to the
//!   event channel.
//!
//! Stdout/stdin are handed out via [`ExternalProcess::take_stdout`] and
//! [`ExternalProcess::take_stdin`]; the byte path never goes through the
//! event channel.
//!
//! Lifecycle:
//!
//! ```text
//! Starting → Running → Exited(code)
//!     ↓          ↓
//!   Failed     Failed
//! ```

use crate::config::CommandSpec;
use crate::error::{RelayError, Result};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long an exited process's stderr is drained before `Exited` is sent.
const DIAGNOSTIC_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Which slot of the relay a process fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Pulls the remote live stream.
    Fetcher,
    /// Converts fetched bytes into PCM.
    Transcoder,
    /// Renders PCM locally.
    Player,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetcher => "fetcher",
            Self::Transcoder => "transcoder",
            Self::Player => "player",
        };
        f.write_str(label)
    }
}

/// Process lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn requested, child not yet confirmed.
    Starting,
    /// Child is alive.
    Running,
    /// Child exited; `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Waiting on the child failed.
    Failed(String),
}

impl ProcessState {
    /// Returns `true` once the process can no longer produce output.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Failed(_))
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Exited(Some(code)) => write!(f, "exited with code {code}"),
            Self::Exited(None) => f.write_str("terminated by signal"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Events emitted by a process (and by connectors wired to it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line written to stderr.
    Diagnostic { role: ProcessRole, line: String },
    /// Forwarding into this process's input failed.
    PipeError { role: ProcessRole, message: String },
    /// The process is gone. Last event for a role: its diagnostics are
    /// flushed first.
    Exited { role: ProcessRole, state: ProcessState },
}

/// Which standard streams are piped back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIo {
    pub stdin: bool,
    pub stdout: bool,
}

impl ProcessIo {
    /// Output only (fetcher).
    pub const SOURCE: Self = Self {
        stdin: false,
        stdout: true,
    };
    /// Input and output (transcoder).
    pub const FILTER: Self = Self {
        stdin: true,
        stdout: true,
    };
    /// Input only (player).
    pub const SINK: Self = Self {
        stdin: true,
        stdout: false,
    };
}

/// Cloneable control handle for a running process.
#[derive(Clone)]
pub struct ProcessHandle {
    role: ProcessRole,
    pid: Option<u32>,
    kill: CancellationToken,
    state_rx: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Killing an exited or already-killed process is a no-op.
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            tracing::debug!(role = %self.role, pid = ?self.pid, "kill requested");
        }
        self.kill.cancel();
    }

    /// Returns `true` if a kill has been requested.
    pub fn kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the process reaches a terminal state.
    pub async fn wait_exit(&self) -> ProcessState {
        let mut rx = self.state_rx.clone();
        let waited = rx
            .wait_for(ProcessState::is_terminal)
            .await
            .map(|state| state.clone());
        match waited {
            Ok(state) => state,
            // Waiter task gone; its last published state is final.
            Err(_) => rx.borrow().clone(),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

/// A spawned external process.
///
/// The child is killed when this value is dropped.
pub struct ExternalProcess {
    command: CommandSpec,
    handle: ProcessHandle,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ExternalProcess {
    /// Spawn `command` and attach the waiter and diagnostic tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Spawn`] if the executable cannot be launched.
    pub fn start(
        role: ProcessRole,
        command: &CommandSpec,
        io: ProcessIo,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(if io.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if io.stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RelayError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_diagnostics(role, stderr, events.clone())));

        state_tx.send_replace(ProcessState::Running);
        let kill = CancellationToken::new();
        tokio::spawn(wait_child(
            role,
            child,
            kill.clone(),
            diagnostics,
            state_tx,
            events,
        ));

        tracing::info!(role = %role, pid = ?pid, command = %command.display(), "process started");

        Ok(Self {
            command: command.clone(),
            handle: ProcessHandle {
                role,
                pid,
                kill,
                state_rx,
            },
            stdin,
            stdout,
        })
    }

    pub fn role(&self) -> ProcessRole {
        self.handle.role
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Returns a cloneable handle for kill/state/exit observation.
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.handle.state()
    }

    /// Request termination (idempotent).
    pub fn kill(&self) {
        self.handle.kill();
    }

    pub async fn wait_exit(&self) -> ProcessState {
        self.handle.wait_exit().await
    }

    /// Take the input byte sink. `None` if not piped or already taken.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the output byte source. `None` if not piped or already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }
}

impl Drop for ExternalProcess {
    fn drop(&mut self) {
        self.handle.kill.cancel();
    }
}

impl fmt::Debug for ExternalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProcess")
            .field("command", &self.command.display())
            .field("handle", &self.handle)
            .finish()
    }
}

async fn wait_child(
    role: ProcessRole,
    mut child: Child,
    kill: CancellationToken,
    diagnostics: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ProcessState>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            // start_kill fails only if the child was already reaped.
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let state = match status {
        Ok(status) => ProcessState::Exited(status.code()),
        Err(e) => ProcessState::Failed(e.to_string()),
    };
    tracing::info!(role = %role, state = %state, "process closed");

    if let Some(mut diagnostics) = diagnostics {
        // A grandchild may keep stderr open; stop reading after the grace.
        if tokio::time::timeout(DIAGNOSTIC_DRAIN_GRACE, &mut diagnostics)
            .await
            .is_err()
        {
            diagnostics.abort();
        }
    }

    state_tx.send_replace(state.clone());
    let _ = events.send(ProcessEvent::Exited { role, state });
}

async fn read_diagnostics(
    role: ProcessRole,
    stderr: tokio::process::ChildStderr,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_owned();
                if line.is_empty() {
                    continue;
                }
                tracing::warn!(role = %role, "stderr: {line}");
                let _ = events.send(ProcessEvent::Diagnostic { role, line });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(role = %role, error = %e, "stderr read ended");
                break;
            }
        }
    }
}
