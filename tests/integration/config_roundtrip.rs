//! TOML persistence of `RelayConfig`.

use liverelay::config::{CommandSpec, RelayConfig};

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = RelayConfig::default();
    config.source.url = "https://example.test/live".into();
    config.retry.max_attempts = 5;
    config.player.command = CommandSpec::new("aplay", ["-f", "S16_LE", "-r", "48000", "-c", "2"]);
    config.save_to_file(&path).unwrap();

    let loaded = RelayConfig::from_file(&path).unwrap();
    assert_eq!(loaded.source.url, "https://example.test/live");
    assert_eq!(loaded.retry.max_attempts, 5);
    assert_eq!(loaded.retry.delay_ms, 5_000);
    assert_eq!(loaded.player.command, config.player.command);
    assert_eq!(loaded.fetcher.command, config.fetcher.command);
}

#[test]
fn partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[control]\nstop_command = \"!halt\"\n").unwrap();

    let loaded = RelayConfig::from_file(&path).unwrap();
    assert_eq!(loaded.control.stop_command, "!halt");
    assert_eq!(loaded.transcoder.command.program, "ffmpeg");
    assert_eq!(loaded.retry.max_attempts, 3);
}

#[test]
fn invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[source]\nurl = \"\"\n").unwrap();
    assert!(RelayConfig::from_file(&path).is_err());

    std::fs::write(&path, "this is = = not toml").unwrap();
    assert!(RelayConfig::from_file(&path).is_err());
}
