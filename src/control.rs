//! Line-oriented console that stands in for the chat platform.
//!
//! Each input line is one command:
//!
//! | line                    | effect                                   |
//! |-------------------------|------------------------------------------|
//! | `join [n]`              | a consumer joined (`n` present, default 1) |
//! | `leave`                 | the consumer set became empty            |
//! | `stop` / stop command   | stop request, answered with a reply line |
//! | `status`                | print supervisor status                  |
//! | `quit` / `exit`         | end the console                          |
//!
//! Replies go to the writer; diagnostics go to tracing.

use crate::error::{RelayError, Result};
use crate::gate::{ConsumerPresence, GateOutcome, LifecycleGate, PresenceEvent, is_stop_command};
use crate::supervisor::{RebuildOutcome, StopOutcome, SupervisorStatus};
use std::io::BufRead;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Presence(PresenceEvent),
    Status,
    Quit,
}

/// Parse one line. Blank lines yield `Ok(None)`.
///
/// # Errors
///
/// Returns [`RelayError::Command`] naming the unrecognised input.
pub fn parse_line(line: &str, stop_command: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if is_stop_command(line, stop_command) {
        return Ok(Some(ConsoleCommand::Presence(PresenceEvent::StopRequested)));
    }

    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();
    let arg = words.next();
    if words.next().is_some() {
        return Err(RelayError::Command(format!("{line} (too many arguments)")));
    }

    let command = match (verb.as_str(), arg) {
        ("join", None) => ConsoleCommand::Presence(PresenceEvent::ConsumerJoined {
            presence: ConsumerPresence { consumers: 1 },
        }),
        ("join", Some(n)) => {
            let consumers = n
                .parse::<usize>()
                .map_err(|_| RelayError::Command(format!("{line} (count must be a number)")))?;
            if consumers == 0 {
                ConsoleCommand::Presence(PresenceEvent::ConsumersEmpty)
            } else {
                ConsoleCommand::Presence(PresenceEvent::ConsumerJoined {
                    presence: ConsumerPresence { consumers },
                })
            }
        }
        ("leave", None) => ConsoleCommand::Presence(PresenceEvent::ConsumersEmpty),
        ("stop", None) => ConsoleCommand::Presence(PresenceEvent::StopRequested),
        ("status", None) => ConsoleCommand::Status,
        ("quit" | "exit", None) => ConsoleCommand::Quit,
        _ => return Err(RelayError::Command(line.to_owned())),
    };
    Ok(Some(command))
}

/// Render a status line.
pub fn format_status(status: &SupervisorStatus) -> String {
    match &status.pipeline {
        Some(p) => format!(
            "generation {} {} from {} ({} bytes relayed)",
            p.generation, p.state, p.source_url, p.bytes_relayed
        ),
        None if status.snapshot.live => format!(
            "generation {} live, no pipeline (waiting for retry)",
            status.snapshot.generation
        ),
        None => format!("idle (generation {})", status.snapshot.generation),
    }
}

fn format_outcome(outcome: &GateOutcome) -> String {
    match outcome {
        GateOutcome::Rebuilt(RebuildOutcome::Started { generation }) => {
            format!("relaying (generation {generation})")
        }
        GateOutcome::Rebuilt(RebuildOutcome::Stale) => "rebuild skipped".to_owned(),
        GateOutcome::AlreadyRelaying
        | GateOutcome::Rebuilt(RebuildOutcome::AlreadyRelaying { .. }) => {
            "already relaying".to_owned()
        }
        GateOutcome::Stopped(StopOutcome::Stopped) => "stopped".to_owned(),
        GateOutcome::Stopped(StopOutcome::NothingActive) => "nothing to stop".to_owned(),
        GateOutcome::Replied(reply) => reply.text.clone(),
    }
}

/// Read stdin lines on a dedicated thread and forward them to a channel.
///
/// A blocked stdin read on a runtime worker keeps the runtime from shutting
/// down; a detached thread does not. The thread ends at EOF, on a read
/// error, or once the receiver is dropped.
///
/// # Errors
///
/// Returns [`RelayError::Io`] if the thread could not be spawned.
pub fn spawn_stdin_lines(capacity: usize) -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(capacity);
    std::thread::Builder::new()
        .name("liverelay-stdin".to_owned())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Serve console commands from `lines` until the channel closes, `quit`
/// arrives, or `cancel` fires.
///
/// # Errors
///
/// Returns [`RelayError::Io`] if writing a reply fails, or
/// [`RelayError::Channel`] if the supervisor is gone. Other failed gate
/// actions are reported on the writer, not returned.
pub async fn run_console<W>(
    mut lines: mpsc::Receiver<String>,
    mut writer: W,
    gate: &LifecycleGate,
    stop_command: &str,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("console cancelled");
                break;
            }
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    tracing::info!("console input closed");
                    break;
                }
            },
        };

        let reply = match parse_line(&line, stop_command) {
            Ok(None) => continue,
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(ConsoleCommand::Status)) => match gate.supervisor().status().await {
                Ok(status) => format_status(&status),
                Err(e) => format!("error: {e}"),
            },
            Ok(Some(ConsoleCommand::Presence(event))) => match gate.handle(event).await {
                Ok(outcome) => format_outcome(&outcome),
                Err(e @ RelayError::Channel(_)) => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "console command failed");
                    format!("error: {e}")
                }
            },
            Err(e) => {
                tracing::warn!(input = %line.trim(), "unrecognised console input");
                e.to_string()
            }
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
