//! Presence- and command-driven session start/stop.

use crate::error::Result;
use crate::supervisor::{RebuildOutcome, StopOutcome, SupervisorHandle};

/// Reply sent when the stop command tore something down.
pub const STOPPED_TEXT: &str = "👋 Stopped the live relay.";

/// Reply sent when the stop command found nothing to stop.
pub const NOTHING_ACTIVE_TEXT: &str = "Nothing is relaying right now.";

/// Non-bot consumers currently present at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerPresence {
    pub consumers: usize,
}

/// Event delivered by the presence/command collaborator.
///
/// Events may arrive in any order and may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    ConsumerJoined { presence: ConsumerPresence },
    ConsumersEmpty,
    StopRequested,
}

/// Human-readable answer to a stop command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReply {
    pub torn_down: bool,
    pub text: String,
}

impl From<StopOutcome> for StopReply {
    fn from(outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Stopped => Self {
                torn_down: true,
                text: STOPPED_TEXT.to_owned(),
            },
            StopOutcome::NothingActive => Self {
                torn_down: false,
                text: NOTHING_ACTIVE_TEXT.to_owned(),
            },
        }
    }
}

/// What the gate did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Rebuilt(RebuildOutcome),
    /// A pipeline was already relaying; the join was a duplicate.
    AlreadyRelaying,
    Stopped(StopOutcome),
    Replied(StopReply),
}

/// Stateless policy mapping presence events onto supervisor requests.
#[derive(Clone)]
pub struct LifecycleGate {
    supervisor: SupervisorHandle,
    source_url: String,
}

impl LifecycleGate {
    pub fn new(supervisor: SupervisorHandle, source_url: impl Into<String>) -> Self {
        Self {
            supervisor,
            source_url: source_url.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// Apply one presence event.
    ///
    /// # Errors
    ///
    /// Propagates a failed rebuild (e.g. the fetcher could not be spawned) or
    /// a closed supervisor channel. Stop requests never fail for lack of a
    /// session.
    pub async fn handle(&self, event: PresenceEvent) -> Result<GateOutcome> {
        match event {
            PresenceEvent::ConsumerJoined { presence } => {
                match self.supervisor.rebuild_if_idle(&self.source_url).await? {
                    RebuildOutcome::AlreadyRelaying { generation } => {
                        tracing::debug!(
                            consumers = presence.consumers,
                            generation,
                            "consumer joined; already relaying"
                        );
                        Ok(GateOutcome::AlreadyRelaying)
                    }
                    outcome => {
                        tracing::info!(
                            consumers = presence.consumers,
                            url = %self.source_url,
                            ?outcome,
                            "consumer joined; relay started"
                        );
                        Ok(GateOutcome::Rebuilt(outcome))
                    }
                }
            }
            PresenceEvent::ConsumersEmpty => {
                tracing::info!("no consumers left; stopping relay");
                let outcome = self.supervisor.stop().await?;
                Ok(GateOutcome::Stopped(outcome))
            }
            PresenceEvent::StopRequested => {
                let outcome = self.supervisor.stop().await?;
                tracing::info!(?outcome, "stop command handled");
                Ok(GateOutcome::Replied(StopReply::from(outcome)))
            }
        }
    }
}

/// Case-insensitive exact match of `text` against the configured command.
pub fn is_stop_command(text: &str, configured: &str) -> bool {
    text.to_lowercase() == configured.to_lowercase()
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::CommandSpec;
    use crate::pipeline::PipelineCommands;
    use crate::playback::PlaybackSink;
    use crate::stream::RelayReader;
    use crate::supervisor::Supervisor;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullSink;

    #[async_trait]
    impl PlaybackSink for NullSink {
        async fn play(&self, _generation: u64, _stream: RelayReader) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn gate() -> LifecycleGate {
        let commands = PipelineCommands {
            fetcher: CommandSpec::new("sh", ["-c", "sleep 30"]),
            transcoder: CommandSpec::new("cat", Vec::<String>::new()),
        };
        let (handle, supervisor) = Supervisor::new(commands, Arc::new(NullSink));
        supervisor.spawn();
        LifecycleGate::new(handle, "http://radio.test")
    }

    fn joined() -> PresenceEvent {
        PresenceEvent::ConsumerJoined {
            presence: ConsumerPresence { consumers: 1 },
        }
    }

    #[test]
    fn stop_command_matches_case_insensitively() {
        assert!(is_stop_command("!stopnts", "!stopnts"));
        assert!(is_stop_command("!StopNTS", "!stopnts"));
        assert!(!is_stop_command("!stopnts now", "!stopnts"));
        assert!(!is_stop_command(" !stopnts", "!stopnts"));
        assert!(is_stop_command("!HALT", "!halt"));
    }

    #[tokio::test]
    async fn duplicate_join_keeps_single_pipeline() {
        let gate = gate();
        assert_eq!(
            gate.handle(joined()).await.unwrap(),
            GateOutcome::Rebuilt(RebuildOutcome::Started { generation: 1 })
        );
        assert_eq!(
            gate.handle(joined()).await.unwrap(),
            GateOutcome::AlreadyRelaying
        );
        assert_eq!(gate.supervisor.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn concurrent_joins_start_one_session() {
        let gate = gate();
        let other = gate.clone();
        let (a, b) = tokio::join!(gate.handle(joined()), other.handle(joined()));
        let outcomes = [a.unwrap(), b.unwrap()];

        let started = outcomes
            .iter()
            .filter(|o| matches!(o, GateOutcome::Rebuilt(RebuildOutcome::Started { .. })))
            .count();
        assert_eq!(started, 1);
        assert!(outcomes.contains(&GateOutcome::AlreadyRelaying));
        assert_eq!(gate.supervisor.snapshot().session, 1);
    }

    #[tokio::test]
    async fn stop_command_replies_both_ways() {
        let gate = gate();
        gate.handle(joined()).await.unwrap();

        let outcome = gate.handle(PresenceEvent::StopRequested).await.unwrap();
        let GateOutcome::Replied(reply) = outcome else {
            panic!("expected reply, got {outcome:?}");
        };
        assert!(reply.torn_down);
        assert_eq!(reply.text, STOPPED_TEXT);

        let outcome = gate.handle(PresenceEvent::StopRequested).await.unwrap();
        let GateOutcome::Replied(reply) = outcome else {
            panic!("expected reply, got {outcome:?}");
        };
        assert!(!reply.torn_down);
        assert_eq!(reply.text, NOTHING_ACTIVE_TEXT);
    }

    #[tokio::test]
    async fn empty_then_join_restarts() {
        let gate = gate();
        gate.handle(joined()).await.unwrap();
        assert_eq!(
            gate.handle(PresenceEvent::ConsumersEmpty).await.unwrap(),
            GateOutcome::Stopped(StopOutcome::Stopped)
        );
        assert_eq!(
            gate.handle(PresenceEvent::ConsumersEmpty).await.unwrap(),
            GateOutcome::Stopped(StopOutcome::NothingActive)
        );
        assert!(matches!(
            gate.handle(joined()).await.unwrap(),
            GateOutcome::Rebuilt(RebuildOutcome::Started { .. })
        ));
    }
}
