//! Error types for the live relay.

/// Top-level error type for the relay pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// An external process could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Forwarding bytes between processes failed.
    #[error("pipe error: {0}")]
    Pipe(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Playback sink error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Unrecognised control command.
    #[error("unrecognised command: {0}")]
    Command(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl RelayError {
    /// Returns `true` for errors raised while launching a process.
    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RelayError>;
