//! Shared test utilities used across multiple test modules.

use crate::config::CommandSpec;

pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

/// Fetcher that idles under a command line containing `marker`.
///
/// `exec` keeps the pid, so the marker is visible both before and after
/// the shell replaces itself with `sleep`.
pub fn marked_fetcher(marker: u32) -> CommandSpec {
    sh(&format!("exec sleep {marker}"))
}

/// Number of live processes whose command line mentions `sleep <marker>`.
///
/// Reaped and zombie processes have an empty command line and are not
/// counted.
#[cfg(target_os = "linux")]
pub fn processes_marked(marker: u32) -> usize {
    let needle = format!("sleep {marker}");
    let needle_nul = format!("sleep\0{marker}");
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            std::fs::read(entry.path().join("cmdline")).is_ok_and(|raw| {
                let cmdline = String::from_utf8_lossy(&raw);
                cmdline.contains(&needle) || cmdline.contains(&needle_nul)
            })
        })
        .count()
}

/// Wait up to `bound` until no process carries `marker`.
#[cfg(target_os = "linux")]
pub async fn wait_until_unmarked(marker: u32, bound: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        if processes_marked(marker) == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
