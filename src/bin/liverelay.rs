//! CLI binary for liverelay.

use clap::{Parser, Subcommand};
use liverelay::control::{run_console, spawn_stdin_lines};
use liverelay::gate::{ConsumerPresence, PresenceEvent};
use liverelay::{RelayConfig, RelaySession};
use std::path::PathBuf;
use tracing::info;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Buffered console lines between the stdin thread and the console loop.
const CONSOLE_LINE_CAPACITY: usize = 16;

/// liverelay: relay a live audio stream into a local player.
#[derive(Parser)]
#[command(name = "liverelay", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the source stream URL.
    #[arg(short, long)]
    url: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start the relay and read control commands from stdin.
    Run {
        /// Start relaying immediately, as if one consumer had joined.
        #[arg(long)]
        join: bool,
    },

    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries console replies.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("liverelay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run { join: false }) {
        Command::Run { join } => run(config, join).await,
        Command::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = if let Some(ref path) = cli.config {
        RelayConfig::from_file(path)?
    } else {
        let path = RelayConfig::default_config_path();
        if path.exists() {
            info!(path = %path.display(), "loading config");
            RelayConfig::from_file(&path)?
        } else {
            RelayConfig::default()
        }
    };
    if let Some(ref url) = cli.url {
        config.source.url.clone_from(url);
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: RelayConfig, join: bool) -> anyhow::Result<()> {
    eprintln!("liverelay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "commands: join [n] | leave | stop | {} | status | quit",
        config.control.stop_command
    );

    let session = RelaySession::start(&config)?;

    if join {
        let outcome = session
            .gate()
            .handle(PresenceEvent::ConsumerJoined {
                presence: ConsumerPresence { consumers: 1 },
            })
            .await;
        if let Err(e) = outcome {
            tracing::error!(error = %e, "initial join failed");
        }
    }

    let console_cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = console_cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted; shutting down");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
            }
        }
    });

    let lines = spawn_stdin_lines(CONSOLE_LINE_CAPACITY)?;
    let stdout = tokio::io::stdout();
    let console = run_console(
        lines,
        stdout,
        session.gate(),
        session.stop_command(),
        &console_cancel,
    );
    if let Err(e) = console.await {
        tracing::error!(error = %e, "console stopped");
    }

    session.shutdown().await?;
    Ok(())
}
