//! Bounded automatic rebuilds driven by playback signals.
//!
//! `Playing` resets the attempt counter. `Idle` and `Stalled` schedule a
//! rebuild after a fixed delay until `max_attempts` is reached; after that
//! the session stays down until an external rebuild starts a new session.
//! Scheduled rebuilds carry the generation they were issued against and are
//! discarded by the supervisor if that generation has been replaced.

use crate::config::RetryConfig;
use crate::error::Result;
use crate::playback::{PlaybackEvent, PlaybackSignal};
use crate::supervisor::{RebuildOutcome, SessionSnapshot, SupervisorHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the controller should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Counter reset after successful playback.
    Reset,
    /// Rebuild after `delay`; `attempt` is 1-based.
    Schedule { attempt: u32, delay: Duration },
    /// No attempts left in this session.
    Exhausted,
    /// No state change.
    Ignore,
}

/// Attempt counter for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Apply `signal` and return the resulting decision.
    pub fn on_signal(&mut self, signal: &PlaybackSignal) -> RetryDecision {
        match signal {
            PlaybackSignal::Playing => {
                self.attempts = 0;
                RetryDecision::Reset
            }
            PlaybackSignal::Idle | PlaybackSignal::Stalled => {
                if self.is_exhausted() {
                    RetryDecision::Exhausted
                } else {
                    self.attempts += 1;
                    RetryDecision::Schedule {
                        attempt: self.attempts,
                        delay: self.delay,
                    }
                }
            }
            PlaybackSignal::Buffering | PlaybackSignal::Error(_) => RetryDecision::Ignore,
        }
    }
}

impl From<&RetryConfig> for RetryState {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.delay())
    }
}

/// The slice of the supervisor the retry controller needs.
#[async_trait]
pub trait RebuildTarget: Send + Sync + 'static {
    fn snapshot(&self) -> SessionSnapshot;

    async fn rebuild_if_current(&self, url: &str, generation: u64) -> Result<RebuildOutcome>;
}

#[async_trait]
impl RebuildTarget for SupervisorHandle {
    fn snapshot(&self) -> SessionSnapshot {
        SupervisorHandle::snapshot(self)
    }

    async fn rebuild_if_current(&self, url: &str, generation: u64) -> Result<RebuildOutcome> {
        SupervisorHandle::rebuild_if_current(self, url, generation).await
    }
}

/// Consumes playback signals and schedules rebuilds.
pub struct RetryController<T: RebuildTarget> {
    target: Arc<T>,
    source_url: String,
    state: RetryState,
    session: u64,
}

impl<T: RebuildTarget> RetryController<T> {
    pub fn new(target: T, source_url: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            target: Arc::new(target),
            source_url: source_url.into(),
            state: RetryState::from(config),
            session: 0,
        }
    }

    /// Process signals until the channel closes or `cancel` fires.
    ///
    /// Pending delayed rebuilds are abandoned on cancellation.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<PlaybackEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = signals.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event, &cancel);
        }
        tracing::debug!("retry controller stopped");
    }

    fn handle(&mut self, event: PlaybackEvent, cancel: &CancellationToken) {
        let snapshot = self.target.snapshot();
        if snapshot.session != self.session {
            self.session = snapshot.session;
            self.state.reset();
        }

        if !snapshot.live || event.generation != snapshot.generation {
            tracing::debug!(
                generation = event.generation,
                current = snapshot.generation,
                signal = %event.signal,
                "ignoring signal from replaced pipeline"
            );
            return;
        }

        match self.state.on_signal(&event.signal) {
            RetryDecision::Reset => {
                tracing::debug!(generation = event.generation, "retry counter reset");
            }
            RetryDecision::Schedule { attempt, delay } => {
                tracing::info!(
                    generation = event.generation,
                    attempt,
                    max = self.state.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling rebuild"
                );
                self.schedule(event.generation, delay, cancel.clone());
            }
            RetryDecision::Exhausted => {
                tracing::warn!(
                    generation = event.generation,
                    max = self.state.max_attempts,
                    "max retries reached; not rebuilding until a new session starts"
                );
            }
            RetryDecision::Ignore => {
                if let PlaybackSignal::Error(message) = &event.signal {
                    tracing::error!(
                        generation = event.generation,
                        error = %message,
                        "playback error"
                    );
                }
            }
        }
    }

    fn schedule(&self, generation: u64, delay: Duration, cancel: CancellationToken) {
        let target = Arc::clone(&self.target);
        let url = self.source_url.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            match target.rebuild_if_current(&url, generation).await {
                Ok(RebuildOutcome::Started { generation: next }) => {
                    tracing::info!(
                        previous = generation,
                        generation = next,
                        "pipeline rebuilt"
                    );
                }
                Ok(outcome) => {
                    tracing::debug!(generation, ?outcome, "scheduled rebuild skipped");
                }
                Err(e) => {
                    tracing::error!(generation, error = %e, "scheduled rebuild failed");
                }
            }
        });
    }
}
