//! Configuration types for the live relay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder substituted with the source URL in fetcher arguments.
pub const URL_PLACEHOLDER: &str = "{url}";

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Live stream source.
    pub source: SourceConfig,
    /// Process that fetches the raw remote stream.
    pub fetcher: FetcherConfig,
    /// Process that converts the fetched bytes into PCM.
    pub transcoder: TranscoderConfig,
    /// Local player fed by the relay.
    pub player: PlayerConfig,
    /// Automatic rebuild policy.
    pub retry: RetryConfig,
    /// Console control surface.
    pub control: ControlConfig,
}

/// Program plus arguments for an external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute `{url}` in every argument, appending the URL when no
    /// argument mentions it.
    #[must_use]
    pub fn with_url(&self, url: &str) -> Self {
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(URL_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(URL_PLACEHOLDER, url)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(url.to_owned());
        }
        Self {
            program: self.program.clone(),
            args,
        }
    }

    /// Human readable command line for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Live stream source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// URL of the live stream.
    pub url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "https://stream-relay-geo.ntslive.net/stream".to_owned(),
        }
    }
}

/// Fetcher process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub command: CommandSpec,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new("curl", ["-L", "--silent", URL_PLACEHOLDER]),
        }
    }
}

/// Transcoder process settings.
///
/// The command must read container audio on stdin and write signed 16-bit
/// little-endian interleaved stereo PCM at 48 kHz on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub command: CommandSpec,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new(
                "ffmpeg",
                [
                    "-i",
                    "pipe:0",
                    "-f",
                    "s16le",
                    "-ar",
                    "48000",
                    "-ac",
                    "2",
                    "-acodec",
                    "pcm_s16le",
                    "-loglevel",
                    "error",
                    "pipe:1",
                ],
            ),
        }
    }
}

/// Local player settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Command that consumes raw PCM on stdin.
    pub command: CommandSpec,
    /// Silence on the relay stream for this long reports a stall (ms).
    pub stall_timeout_ms: u64,
}

impl PlayerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new(
                "ffplay",
                [
                    "-nodisp",
                    "-loglevel",
                    "error",
                    "-f",
                    "s16le",
                    "-ar",
                    "48000",
                    "-ch_layout",
                    "stereo",
                    "-i",
                    "pipe:0",
                ],
            ),
            stall_timeout_ms: 15_000,
        }
    }
}

/// Automatic rebuild policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Rebuilds allowed per session before giving up.
    pub max_attempts: u32,
    /// Fixed delay before each rebuild (ms).
    pub delay_ms: u64,
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
        }
    }
}

/// Console control surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Stop command, matched case-insensitively.
    pub stop_command: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stop_command: "!stopnts".to_owned(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the relay cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`](crate::error::RelayError::Config) naming
    /// the bad field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let bad =
            |field: &str| crate::error::RelayError::Config(format!("{field} must not be empty"));
        if self.source.url.trim().is_empty() {
            return Err(bad("source.url"));
        }
        if self.fetcher.command.program.trim().is_empty() {
            return Err(bad("fetcher.command.program"));
        }
        if self.transcoder.command.program.trim().is_empty() {
            return Err(bad("transcoder.command.program"));
        }
        if self.player.command.program.trim().is_empty() {
            return Err(bad("player.command.program"));
        }
        if self.control.stop_command.trim().is_empty() {
            return Err(bad("control.stop_command"));
        }
        Ok(())
    }

    /// Returns the default config file path: `~/.config/liverelay/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("liverelay").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("liverelay")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/liverelay-config/config.toml")
        }
    }
}
