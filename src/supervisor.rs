//! Single-owner supervisor for the live pipeline.
//!
//! All mutation of the current pipeline goes through one command channel
//! served by [`Supervisor::run`], so rebuild and stop requests are applied
//! strictly one after another. A rebuild destroys the previous pipeline and
//! waits for it to close before the next one is spawned; two pipelines never
//! feed the sink at once.
//!
//! Every rebuild and stop advances the *generation*. Work scheduled against
//! an older generation (for example a delayed retry) is discarded.

use crate::error::{RelayError, Result};
use crate::pipeline::{Pipeline, PipelineCommands, PipelineState, PipelineStatus};
use crate::playback::{PlaybackEvent, PlaybackSignal, PlaybackSink, SignalSender};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Default request channel capacity.
const REQUEST_CAPACITY: usize = 32;

/// What a rebuild request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// A new pipeline is playing under this generation.
    Started { generation: u64 },
    /// The request targeted a replaced generation or a stopped session.
    Stale,
    /// A live pipeline was already relaying; nothing was rebuilt.
    AlreadyRelaying { generation: u64 },
}

/// What a stop request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live session was torn down.
    Stopped,
    /// There was nothing to stop.
    NothingActive,
}

/// Published on every rebuild/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    /// Advances on every rebuild and stop.
    pub generation: u64,
    /// Advances only on externally requested rebuilds.
    pub session: u64,
    /// `true` between an external rebuild and the next stop.
    pub live: bool,
}

/// Full status, including the live pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub snapshot: SessionSnapshot,
    pub pipeline: Option<PipelineStatus>,
}

impl SupervisorStatus {
    /// Returns `true` if a pipeline is currently relaying.
    pub fn is_relaying(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.state == PipelineState::Active)
    }
}

enum SupervisorCommand {
    Rebuild {
        url: String,
        reply: oneshot::Sender<Result<RebuildOutcome>>,
    },
    RebuildIfCurrent {
        url: String,
        generation: u64,
        reply: oneshot::Sender<Result<RebuildOutcome>>,
    },
    RebuildIfIdle {
        url: String,
        reply: oneshot::Sender<Result<RebuildOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    Status {
        reply: oneshot::Sender<SupervisorStatus>,
    },
}

/// Cloneable client for the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    request_tx: mpsc::Sender<SupervisorCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T> {
        let (reply, reply_rx) = oneshot::channel();
        self.request_tx
            .send(build(reply))
            .await
            .map_err(|e| RelayError::Channel(format!("supervisor unavailable: {e}")))?;
        reply_rx
            .await
            .map_err(|e| RelayError::Channel(format!("supervisor reply dropped: {e}")))
    }

    /// Replace any current pipeline with a fresh one for `url`, starting a
    /// new session.
    ///
    /// # Errors
    ///
    /// Returns the build error if a process could not be spawned; the session
    /// is left without a pipeline.
    pub async fn rebuild(&self, url: &str) -> Result<RebuildOutcome> {
        let url = url.to_owned();
        self.request(|reply| SupervisorCommand::Rebuild { url, reply })
            .await?
    }

    /// Rebuild only if the session is live and still at `generation`.
    ///
    /// # Errors
    ///
    /// Same as [`rebuild`](Self::rebuild).
    pub async fn rebuild_if_current(
        &self,
        url: &str,
        generation: u64,
    ) -> Result<RebuildOutcome> {
        let url = url.to_owned();
        self.request(|reply| SupervisorCommand::RebuildIfCurrent {
            url,
            generation,
            reply,
        })
        .await?
    }

    /// Start a new session unless a live pipeline is already relaying.
    ///
    /// The check and the rebuild happen in one supervisor step, so
    /// concurrent callers start at most one session.
    ///
    /// # Errors
    ///
    /// Same as [`rebuild`](Self::rebuild).
    pub async fn rebuild_if_idle(&self, url: &str) -> Result<RebuildOutcome> {
        let url = url.to_owned();
        self.request(|reply| SupervisorCommand::RebuildIfIdle { url, reply })
            .await?
    }

    /// Tear down the current pipeline and stop playback.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Channel`] if the supervisor task is gone.
    pub async fn stop(&self) -> Result<StopOutcome> {
        self.request(|reply| SupervisorCommand::Stop { reply }).await
    }

    /// # Errors
    ///
    /// Returns [`RelayError::Channel`] if the supervisor task is gone.
    pub async fn status(&self) -> Result<SupervisorStatus> {
        self.request(|reply| SupervisorCommand::Status { reply }).await
    }

    /// Latest published snapshot, without a round trip.
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshot_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Owner of the single current pipeline.
pub struct Supervisor {
    commands: PipelineCommands,
    sink: Arc<dyn PlaybackSink>,
    failure_signals: Option<SignalSender>,
    current: Option<Pipeline>,
    snapshot: SessionSnapshot,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    request_rx: mpsc::Receiver<SupervisorCommand>,
}

impl Supervisor {
    /// Create the supervisor and its client handle.
    #[must_use]
    pub fn new(
        commands: PipelineCommands,
        sink: Arc<dyn PlaybackSink>,
    ) -> (SupervisorHandle, Self) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        (
            SupervisorHandle {
                request_tx,
                snapshot_rx,
            },
            Self {
                commands,
                sink,
                failure_signals: None,
                current: None,
                snapshot: SessionSnapshot::default(),
                snapshot_tx,
                request_rx,
            },
        )
    }

    /// Report failed builds as [`PlaybackSignal::Stalled`] on `signals`, so
    /// the retry controller treats a pipeline that never started like one
    /// that died.
    #[must_use]
    pub fn with_failure_signals(mut self, signals: SignalSender) -> Self {
        self.failure_signals = Some(signals);
        self
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve requests until every handle is dropped, then tear down.
    pub async fn run(mut self) {
        while let Some(command) = self.request_rx.recv().await {
            match command {
                SupervisorCommand::Rebuild { url, reply } => {
                    let result = self.rebuild(&url, true).await;
                    let _ = reply.send(result);
                }
                SupervisorCommand::RebuildIfCurrent {
                    url,
                    generation,
                    reply,
                } => {
                    let current = self.snapshot.generation == generation;
                    let result = if self.snapshot.live && current {
                        self.rebuild(&url, false).await
                    } else {
                        tracing::info!(
                            requested = generation,
                            current = self.snapshot.generation,
                            live = self.snapshot.live,
                            "discarding stale rebuild"
                        );
                        Ok(RebuildOutcome::Stale)
                    };
                    let _ = reply.send(result);
                }
                SupervisorCommand::RebuildIfIdle { url, reply } => {
                    let result = if self.is_relaying() {
                        tracing::debug!(
                            generation = self.snapshot.generation,
                            "already relaying; rebuild skipped"
                        );
                        Ok(RebuildOutcome::AlreadyRelaying {
                            generation: self.snapshot.generation,
                        })
                    } else {
                        self.rebuild(&url, true).await
                    };
                    let _ = reply.send(result);
                }
                SupervisorCommand::Stop { reply } => {
                    let outcome = self.stop().await;
                    let _ = reply.send(outcome);
                }
                SupervisorCommand::Status { reply } => {
                    let _ = reply.send(SupervisorStatus {
                        snapshot: self.snapshot,
                        pipeline: self.current.as_ref().map(Pipeline::status),
                    });
                }
            }
        }

        self.teardown().await;
        tracing::debug!("supervisor stopped");
    }

    fn is_relaying(&self) -> bool {
        self.snapshot.live
            && self
                .current
                .as_ref()
                .is_some_and(|p| p.state() == PipelineState::Active)
    }

    fn publish(&mut self) {
        self.snapshot_tx.send_replace(self.snapshot);
    }

    /// Stop playback and destroy the current pipeline, if any.
    async fn teardown(&mut self) -> bool {
        let Some(pipeline) = self.current.take() else {
            return false;
        };
        self.sink.stop().await;
        pipeline.destroy().await;
        true
    }

    async fn rebuild(&mut self, url: &str, new_session: bool) -> Result<RebuildOutcome> {
        self.teardown().await;

        self.snapshot.generation += 1;
        if new_session {
            self.snapshot.session += 1;
        }
        self.snapshot.live = true;
        self.publish();
        let generation = self.snapshot.generation;

        let (pipeline, stream) = match Pipeline::build(&self.commands, url, generation) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!(generation, error = %e, "pipeline build failed");
                self.report_failure(generation, &e);
                return Err(e);
            }
        };

        if let Err(e) = self.sink.play(generation, stream).await {
            tracing::error!(generation, error = %e, "playback sink refused stream");
            pipeline.destroy().await;
            self.report_failure(generation, &e);
            return Err(e);
        }

        self.current = Some(pipeline);
        Ok(RebuildOutcome::Started { generation })
    }

    async fn stop(&mut self) -> StopOutcome {
        let was_live = self.snapshot.live;
        let torn_down = self.teardown().await;
        if was_live || torn_down {
            self.snapshot.generation += 1;
            self.snapshot.live = false;
            self.publish();
            tracing::info!(generation = self.snapshot.generation, "session stopped");
        }
        if torn_down {
            StopOutcome::Stopped
        } else {
            StopOutcome::NothingActive
        }
    }

    fn report_failure(&self, generation: u64, error: &RelayError) {
        if let Some(signals) = &self.failure_signals {
            let _ = signals.send(PlaybackEvent::new(
                generation,
                PlaybackSignal::Error(error.to_string()),
            ));
            let _ = signals.send(PlaybackEvent::new(generation, PlaybackSignal::Stalled));
        }
    }
}
