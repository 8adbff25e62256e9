//! One live relay attempt: fetcher → pipe → transcoder → relay stream.
//!
//! The fetcher and transcoder are coupled. A monitor task consumes both
//! processes' events from a single channel and drives the state machine:
//!
//! ```text
//! Building → Active → Closing → Closed
//! ```
//!
//! The first exit (or pipe failure) kills the partner and enters `Closing`;
//! once both processes are gone the relay stream is ended and the pipeline
//! is `Closed`.

use crate::config::{CommandSpec, RelayConfig};
use crate::error::{RelayError, Result};
use crate::pipe;
use crate::process::{ExternalProcess, ProcessEvent, ProcessHandle, ProcessIo, ProcessRole};
use crate::stream::{RelayReader, RelayWriter, relay_channel};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Read size for the transcoder output pump.
const PUMP_CHUNK_BYTES: usize = 8 * 1024;

/// How long a closed pipeline waits for buffered transcoder output.
const PUMP_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Pipeline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Building,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Commands used to build pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCommands {
    /// Fetcher command; `{url}` is substituted per build.
    pub fetcher: CommandSpec,
    pub transcoder: CommandSpec,
}

impl From<&RelayConfig> for PipelineCommands {
    fn from(config: &RelayConfig) -> Self {
        Self {
            fetcher: config.fetcher.command.clone(),
            transcoder: config.transcoder.command.clone(),
        }
    }
}

/// Point-in-time view of a pipeline for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub generation: u64,
    pub source_url: String,
    pub state: PipelineState,
    pub bytes_relayed: u64,
}

/// A coupled fetcher + transcoder pair feeding a relay stream.
pub struct Pipeline {
    generation: u64,
    source_url: String,
    fetcher: ExternalProcess,
    transcoder: ExternalProcess,
    writer: RelayWriter,
    state_rx: watch::Receiver<PipelineState>,
    bytes_relayed: Arc<AtomicU64>,
}

impl Pipeline {
    /// Spawn and wire a new pipeline for `source_url`.
    ///
    /// Returns the pipeline and the pull side of its relay stream.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Spawn`] if either process cannot be launched.
    /// A fetcher already started is killed before returning.
    pub fn build(
        commands: &PipelineCommands,
        source_url: &str,
        generation: u64,
    ) -> Result<(Self, RelayReader)> {
        let (state_tx, state_rx) = watch::channel(PipelineState::Building);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let fetch_cmd = commands.fetcher.with_url(source_url);
        let mut fetcher = ExternalProcess::start(
            ProcessRole::Fetcher,
            &fetch_cmd,
            ProcessIo::SOURCE,
            event_tx.clone(),
        )?;
        // On failure `fetcher` is dropped here, which kills it.
        let mut transcoder = ExternalProcess::start(
            ProcessRole::Transcoder,
            &commands.transcoder,
            ProcessIo::FILTER,
            event_tx.clone(),
        )?;

        let fetch_out = fetcher
            .take_stdout()
            .ok_or_else(|| RelayError::Pipe("fetcher stdout not captured".to_owned()))?;
        let transcode_in = transcoder
            .take_stdin()
            .ok_or_else(|| RelayError::Pipe("transcoder stdin not captured".to_owned()))?;
        let transcode_out = transcoder
            .take_stdout()
            .ok_or_else(|| RelayError::Pipe("transcoder stdout not captured".to_owned()))?;

        pipe::connect(fetch_out, transcode_in, ProcessRole::Transcoder, event_tx);

        let (writer, reader) = relay_channel();
        let bytes_relayed = Arc::new(AtomicU64::new(0));
        let pump = tokio::spawn(pump_output(
            generation,
            transcode_out,
            writer.clone(),
            Arc::clone(&bytes_relayed),
        ));

        // Active is published before the monitor owns the sender so an early
        // exit cannot be overwritten.
        state_tx.send_replace(PipelineState::Active);
        tokio::spawn(monitor(
            generation,
            fetcher.handle(),
            transcoder.handle(),
            writer.clone(),
            pump,
            event_rx,
            state_tx,
        ));

        tracing::info!(generation, url = %source_url, "pipeline active");

        Ok((
            Self {
                generation,
                source_url: source_url.to_owned(),
                fetcher,
                transcoder,
                writer,
                state_rx,
                bytes_relayed,
            },
            reader,
        ))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub fn fetcher(&self) -> ProcessHandle {
        self.fetcher.handle()
    }

    pub fn transcoder(&self) -> ProcessHandle {
        self.transcoder.handle()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            generation: self.generation,
            source_url: self.source_url.clone(),
            state: self.state(),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }

    /// Wait until both processes are gone.
    pub async fn wait_closed(&self) {
        let mut rx = self.state_rx.clone();
        // Err means the monitor is gone, which only happens after Closed.
        let _ = rx.wait_for(|state| *state == PipelineState::Closed).await;
    }

    /// Kill both processes, end the relay stream, and wait for `Closed`.
    ///
    /// Safe to call repeatedly and on a pipeline that already closed.
    pub async fn destroy(&self) {
        self.fetcher.kill();
        self.transcoder.kill();
        self.writer.end();
        self.wait_closed().await;
        tracing::info!(generation = self.generation, "pipeline destroyed");
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("generation", &self.generation)
            .field("source_url", &self.source_url)
            .field("state", &self.state())
            .finish()
    }
}

/// Copy transcoder stdout into the relay stream until EOF or the reader is gone.
async fn pump_output(
    generation: u64,
    mut stdout: ChildStdout,
    writer: RelayWriter,
    bytes_relayed: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; PUMP_CHUNK_BYTES];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !writer.push(Bytes::copy_from_slice(&buf[..n])) {
                    // Dropping stdout lets the transcoder see a broken pipe.
                    tracing::debug!(generation, "relay reader gone; stopping output pump");
                    break;
                }
                bytes_relayed.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(generation, error = %e, "transcoder output read failed");
                break;
            }
        }
    }
    writer.end();
}

async fn monitor(
    generation: u64,
    fetcher: ProcessHandle,
    transcoder: ProcessHandle,
    writer: RelayWriter,
    pump: JoinHandle<()>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    state_tx: watch::Sender<PipelineState>,
) {
    let mut fetcher_done = false;
    let mut transcoder_done = false;

    let begin_closing = |reason: &str| {
        fetcher.kill();
        transcoder.kill();
        let changed = state_tx.send_if_modified(|state| {
            if *state == PipelineState::Active || *state == PipelineState::Building {
                *state = PipelineState::Closing;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(generation, reason, "pipeline closing");
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Diagnostic { .. } => {}
            ProcessEvent::PipeError { role, message } => {
                tracing::warn!(generation, role = %role, "{message}");
                begin_closing("pipe error");
            }
            ProcessEvent::Exited { role, state } => {
                match role {
                    ProcessRole::Fetcher => fetcher_done = true,
                    ProcessRole::Transcoder => transcoder_done = true,
                    ProcessRole::Player => {}
                }
                tracing::info!(generation, role = %role, state = %state, "pipeline member exited");
                begin_closing(&format!("{role} exited"));
                if fetcher_done && transcoder_done {
                    break;
                }
            }
        }
    }

    if writer.is_ended() {
        pump.abort();
    } else if tokio::time::timeout(PUMP_DRAIN_GRACE, pump).await.is_err() {
        // A grandchild may still hold the transcoder's stdout open.
        tracing::debug!(generation, "output pump did not drain in time");
    }
    writer.end();
    state_tx.send_replace(PipelineState::Closed);
    tracing::info!(generation, "pipeline closed");
}
