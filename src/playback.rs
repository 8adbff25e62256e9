//! Playback sink contract and a local process-backed sink.
//!
//! A sink receives the relay stream for one pipeline generation and reports
//! lifecycle signals tagged with that generation. Signals from a generation
//! that has since been replaced are ignored by the retry controller.

use crate::config::{CommandSpec, PlayerConfig};
use crate::error::{RelayError, Result};
use crate::process::{ExternalProcess, ProcessIo, ProcessRole, ProcessState};
use crate::stream::RelayReader;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle signal reported by a playback sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// Audio is flowing.
    Playing,
    /// Waiting for the first bytes.
    Buffering,
    /// The resource ended; nothing is playing.
    Idle,
    /// No data arrived within the stall timeout.
    Stalled,
    /// Sink-side failure. Diagnostic only.
    Error(String),
}

impl fmt::Display for PlaybackSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playing => f.write_str("playing"),
            Self::Buffering => f.write_str("buffering"),
            Self::Idle => f.write_str("idle"),
            Self::Stalled => f.write_str("stalled"),
            Self::Error(err) => write!(f, "error: {err}"),
        }
    }
}

/// A signal tagged with the pipeline generation it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub generation: u64,
    pub signal: PlaybackSignal,
}

impl PlaybackEvent {
    pub fn new(generation: u64, signal: PlaybackSignal) -> Self {
        Self { generation, signal }
    }
}

/// Sender half used by sinks (and the supervisor) to report signals.
pub type SignalSender = mpsc::UnboundedSender<PlaybackEvent>;

/// Consumer of the relay stream.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Start playing `stream`, replacing whatever was playing before.
    async fn play(&self, generation: u64, stream: RelayReader) -> Result<()>;

    /// Stop playback. Must not fail when nothing is playing.
    async fn stop(&self);
}

struct ActivePlayback {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Feeds PCM into a local player process (e.g. `ffplay`, `aplay`).
pub struct ProcessSink {
    command: CommandSpec,
    stall_timeout: Duration,
    signals: SignalSender,
    active: Mutex<Option<ActivePlayback>>,
}

impl ProcessSink {
    pub fn new(config: &PlayerConfig, signals: SignalSender) -> Self {
        Self {
            command: config.command.clone(),
            stall_timeout: config.stall_timeout(),
            signals,
            active: Mutex::new(None),
        }
    }

    /// Generation currently being fed, if any.
    pub async fn current_generation(&self) -> Option<u64> {
        self.active.lock().await.as_ref().map(|a| a.generation)
    }
}

#[async_trait]
impl PlaybackSink for ProcessSink {
    async fn play(&self, generation: u64, stream: RelayReader) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let (events, _) = mpsc::unbounded_channel();
        let mut player =
            ExternalProcess::start(ProcessRole::Player, &self.command, ProcessIo::SINK, events)?;
        let stdin = player
            .take_stdin()
            .ok_or_else(|| RelayError::Playback("player stdin not captured".to_owned()))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(feed_player(
            generation,
            stream,
            player,
            stdin,
            self.signals.clone(),
            cancel.clone(),
            self.stall_timeout,
        ));

        *active = Some(ActivePlayback {
            generation,
            cancel,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.task.await;
            tracing::info!(generation = previous.generation, "playback stopped");
        }
    }
}

enum FeedStep {
    Chunk(bytes::Bytes),
    End,
    Stalled,
    PlayerExited(ProcessState),
    Cancelled,
}

async fn feed_player(
    generation: u64,
    mut stream: RelayReader,
    player: ExternalProcess,
    mut stdin: ChildStdin,
    signals: SignalSender,
    cancel: CancellationToken,
    stall_timeout: Duration,
) {
    let emit = |signal: PlaybackSignal| {
        tracing::info!(generation, signal = %signal, "playback status");
        let _ = signals.send(PlaybackEvent::new(generation, signal));
    };

    let exit = player.handle();
    let mut playing = false;
    emit(PlaybackSignal::Buffering);

    loop {
        let step = tokio::select! {
            () = cancel.cancelled() => FeedStep::Cancelled,
            state = exit.wait_exit() => FeedStep::PlayerExited(state),
            next = tokio::time::timeout(stall_timeout, stream.recv()) => match next {
                Ok(Some(chunk)) => FeedStep::Chunk(chunk),
                Ok(None) => FeedStep::End,
                Err(_) => FeedStep::Stalled,
            },
        };

        match step {
            FeedStep::Chunk(chunk) => {
                let written = tokio::select! {
                    () = cancel.cancelled() => break,
                    res = stdin.write_all(&chunk) => res,
                };
                if let Err(e) = written {
                    emit(PlaybackSignal::Error(format!("player input closed: {e}")));
                    emit(PlaybackSignal::Idle);
                    break;
                }
                if !playing {
                    playing = true;
                    emit(PlaybackSignal::Playing);
                }
            }
            FeedStep::End => {
                emit(PlaybackSignal::Idle);
                break;
            }
            FeedStep::Stalled => {
                tracing::warn!(generation, timeout = ?stall_timeout, "relay stream stalled");
                emit(PlaybackSignal::Stalled);
                break;
            }
            FeedStep::PlayerExited(state) => {
                emit(PlaybackSignal::Error(format!("player {state}")));
                emit(PlaybackSignal::Idle);
                break;
            }
            FeedStep::Cancelled => break,
        }
    }

    drop(stdin);
    player.kill();
}
