//! Shared helpers for integration tests.
//!
//! Stand-in processes are plain `sh` scripts, so these tests need a Unix host.

use async_trait::async_trait;
use liverelay::config::{CommandSpec, RelayConfig};
use liverelay::pipeline::PipelineCommands;
use liverelay::playback::PlaybackSink;
use liverelay::stream::RelayReader;
use liverelay::supervisor::{Supervisor, SupervisorHandle};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for anything that waits on a real process.
pub(crate) const BOUND: Duration = Duration::from_secs(10);

pub(crate) fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

/// Fetcher that records its pid in `pid_file` and then idles.
///
/// `exec` keeps the pid stable, so the recorded pid is the process the
/// pipeline kills.
pub(crate) fn pid_recording_fetcher(pid_file: &Path) -> CommandSpec {
    sh(&format!("echo $$ >> '{}'; exec sleep 30", pid_file.display()))
}

pub(crate) fn commands(fetcher: CommandSpec) -> PipelineCommands {
    PipelineCommands {
        fetcher,
        transcoder: CommandSpec::new("cat", Vec::<String>::new()),
    }
}

/// Relay config wired to stand-in processes.
pub(crate) fn stand_in_config(fetcher: CommandSpec) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.source.url = "http://radio.test/live".into();
    config.fetcher.command = fetcher;
    config.transcoder.command = CommandSpec::new("cat", Vec::<String>::new());
    config.player.command = sh("cat > /dev/null");
    config
}

/// Sink that drains every stream it is given.
#[derive(Default)]
pub(crate) struct DrainingSink {
    pub(crate) generations: Mutex<Vec<u64>>,
}

#[async_trait]
impl PlaybackSink for DrainingSink {
    async fn play(&self, generation: u64, mut stream: RelayReader) -> liverelay::Result<()> {
        self.generations.lock().unwrap().push(generation);
        tokio::spawn(async move { while stream.recv().await.is_some() {} });
        Ok(())
    }

    async fn stop(&self) {}
}

pub(crate) fn start_supervisor(
    commands: PipelineCommands,
) -> (SupervisorHandle, Arc<DrainingSink>) {
    let sink = Arc::new(DrainingSink::default());
    let (handle, supervisor) = Supervisor::new(commands, sink.clone());
    supervisor.spawn();
    (handle, sink)
}

/// Pids recorded by [`pid_recording_fetcher`], waiting until `expected`
/// fetchers have started.
pub(crate) async fn recorded_pids(pid_file: &Path, expected: usize) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + BOUND;
    loop {
        let pids: Vec<u32> = std::fs::read_to_string(pid_file)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        if pids.len() >= expected {
            return pids;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {expected} fetchers started",
            pids.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether `pid` is still a live process.
pub(crate) fn is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
