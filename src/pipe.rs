//! Byte forwarding from one process's output into another's input.

use crate::process::{ProcessEvent, ProcessRole};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Read size for each forwarded chunk.
const CHUNK_BYTES: usize = 16 * 1024;

/// Byte accounting for a finished connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeReport {
    /// Bytes written into the sink.
    pub forwarded: u64,
    /// Bytes read from the source after the sink stopped accepting data.
    pub discarded: u64,
}

/// Forward `source` into `sink` until `source` ends.
///
/// Chunks are written in arrival order and `write_all` applies back-pressure
/// to the reader. When the sink refuses data, a [`ProcessEvent::PipeError`]
/// is emitted once, the sink is dropped, and the remaining source bytes are
/// drained and discarded. Source EOF closes the sink.
pub async fn forward<R, W>(
    mut source: R,
    sink: W,
    sink_role: ProcessRole,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> PipeReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = Some(sink);
    let mut report = PipeReport::default();
    let mut buf = vec![0u8; CHUNK_BYTES];

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(sink = %sink_role, error = %e, "pipe source read failed");
                let _ = events.send(ProcessEvent::PipeError {
                    role: sink_role,
                    message: format!("source read failed: {e}"),
                });
                break;
            }
        };

        let Some(writer) = sink.as_mut() else {
            report.discarded += n as u64;
            continue;
        };

        match writer.write_all(&buf[..n]).await {
            Ok(()) => report.forwarded += n as u64,
            Err(e) => {
                tracing::error!(
                    sink = %sink_role,
                    error = %e,
                    "pipe sink closed; discarding input"
                );
                let _ = events.send(ProcessEvent::PipeError {
                    role: sink_role,
                    message: format!("sink write failed: {e}"),
                });
                report.discarded += n as u64;
                sink = None;
            }
        }
    }

    if let Some(mut writer) = sink {
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(sink = %sink_role, error = %e, "pipe sink shutdown failed");
        }
    }

    tracing::debug!(
        sink = %sink_role,
        forwarded = report.forwarded,
        discarded = report.discarded,
        "pipe closed"
    );
    report
}

/// Spawn [`forward`] as a background task.
pub fn connect<R, W>(
    source: R,
    sink: W,
    sink_role: ProcessRole,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<PipeReport>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(forward(source, sink, sink_role, events))
}
