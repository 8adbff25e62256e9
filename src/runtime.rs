//! Session wiring: supervisor, retry controller, gate and playback sink.

use crate::config::RelayConfig;
use crate::error::Result;
use crate::gate::LifecycleGate;
use crate::pipeline::PipelineCommands;
use crate::playback::{PlaybackEvent, PlaybackSink, ProcessSink, SignalSender};
use crate::retry::RetryController;
use crate::supervisor::{StopOutcome, Supervisor, SupervisorHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A running relay session.
///
/// Owns the background tasks. Call [`shutdown`](Self::shutdown) to tear the
/// pipeline down and wait for the tasks to finish.
pub struct RelaySession {
    gate: LifecycleGate,
    stop_command: String,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl RelaySession {
    /// Start a session that plays through the configured player command.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`](crate::RelayError::Config) if the
    /// configuration is invalid.
    pub fn start(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ProcessSink::new(&config.player, signals_tx.clone()));
        Ok(Self::with_sink(config, sink, signals_tx, signals_rx))
    }

    /// Start a session around a caller-provided sink.
    ///
    /// `signals_tx` must be the sender the sink reports on; build failures
    /// are reported on it too.
    pub fn with_sink(
        config: &RelayConfig,
        sink: Arc<dyn PlaybackSink>,
        signals_tx: SignalSender,
        signals_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        let (handle, supervisor) = Supervisor::new(PipelineCommands::from(config), sink);
        let supervisor = supervisor.with_failure_signals(signals_tx);
        workers.spawn(supervisor.run());

        let retry = RetryController::new(handle.clone(), config.source.url.clone(), &config.retry);
        workers.spawn(retry.run(signals_rx, cancel.clone()));

        tracing::info!(
            url = %config.source.url,
            fetcher = %config.fetcher.command.display(),
            transcoder = %config.transcoder.command.display(),
            "relay session ready"
        );

        Self {
            gate: LifecycleGate::new(handle, config.source.url.clone()),
            stop_command: config.control.stop_command.clone(),
            cancel,
            workers,
        }
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        self.gate.supervisor()
    }

    pub fn stop_command(&self) -> &str {
        &self.stop_command
    }

    /// Token cancelled when the session shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop any pipeline, end the background tasks and wait for them.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Channel`](crate::RelayError::Channel) if the
    /// supervisor task had already gone away.
    pub async fn shutdown(self) -> Result<StopOutcome> {
        let Self {
            gate,
            cancel,
            mut workers,
            ..
        } = self;

        let outcome = gate.supervisor().stop().await;
        cancel.cancel();
        // Last handle: the supervisor loop ends once it is dropped.
        drop(gate);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "relay task panicked");
                }
            }
        }
        tracing::info!("relay session shut down");
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::CommandSpec;
    use crate::gate::{ConsumerPresence, GateOutcome, PresenceEvent};
    use crate::pipeline::PipelineState;

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.source.url = "http://radio.test".into();
        config.fetcher.command = CommandSpec::new("sh", ["-c", "sleep 30"]);
        config.transcoder.command = CommandSpec::new("cat", Vec::<String>::new());
        config.player.command = CommandSpec::new("sh", ["-c", "cat > /dev/null"]);
        config
    }

    #[tokio::test]
    async fn start_join_shutdown() {
        let session = RelaySession::start(&config()).unwrap();
        let outcome = session
            .gate()
            .handle(PresenceEvent::ConsumerJoined {
                presence: ConsumerPresence { consumers: 2 },
            })
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Rebuilt(_)));

        let status = session.supervisor().status().await.unwrap();
        assert_eq!(status.pipeline.unwrap().state, PipelineState::Active);

        assert_eq!(session.shutdown().await.unwrap(), StopOutcome::Stopped);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = config();
        config.source.url.clear();
        assert!(RelaySession::start(&config).is_err());
    }
}
