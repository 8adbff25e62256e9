//! liverelay: relays a live network audio stream into a playback sink.
//!
//! The relay is a chain of two external processes feeding a local sink:
//! Network → fetcher → transcoder → relay stream → playback
//!
//! # Architecture
//!
//! - **Process**: spawned fetcher/transcoder/player with typed lifecycle events
//! - **Pipe**: back-pressured byte forwarding between two processes
//! - **Stream**: push-to-pull bridge from transcoder output to the sink
//! - **Pipeline**: one coupled fetcher + transcoder pair; either dying ends both
//! - **Supervisor**: keeps at most one pipeline alive and serializes rebuilds
//! - **Retry**: bounded rebuilds with a fixed delay, driven by playback signals
//! - **Gate**: presence and stop-command policy for starting/stopping a session

pub mod config;
pub mod control;
pub mod error;
pub mod gate;
pub mod pipe;
pub mod pipeline;
pub mod playback;
pub mod process;
pub mod retry;
pub mod runtime;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use gate::{LifecycleGate, PresenceEvent};
pub use pipeline::{Pipeline, PipelineState};
pub use playback::{PlaybackSignal, PlaybackSink};
pub use runtime::RelaySession;
pub use supervisor::{SessionSnapshot, SupervisorHandle};
