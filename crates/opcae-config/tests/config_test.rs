#![allow(clippy::unwrap_used)]
// Loading and saving config files on disk.

use std::time::Duration;

use opcae_config::{Config, ConfigError, ServerProfile, load_config_from, resolve_server, save_config_to};
use opcae_core::{Backpressure, ServerId};
use pretty_assertions::assert_eq;

// ── Helpers ─────────────────────────────────────────────────────────

fn write(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

// ── Loading ─────────────────────────────────────────────────────────

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg, Config::default());
    assert_eq!(cfg.defaults.backpressure, "wait");
    assert_eq!(cfg.defaults.queue_capacity, 256);
}

#[test]
fn test_load_profiles_and_partial_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        &dir,
        r#"
default_server = "plant"

[defaults]
buffer_time_ms = 250
backpressure = "drop-newest"

[servers.plant]
prog_id = "Vendor.AlarmServer.1"
node = "scada01"
max_size = 100

[servers.lab]
clsid = "{6E3D7B1A-0C4F-4E21-9D5B-2F1A3C4D5E6F}"
backpressure = "wait"
wait_timeout_ms = 20
"#,
    );

    let cfg = load_config_from(&path).unwrap();
    assert_eq!(cfg.defaults.buffer_time_ms, 250);
    assert!(cfg.defaults.active);
    assert_eq!(cfg.servers.len(), 2);

    let (target, sub) = resolve_server(&cfg, None).unwrap();
    assert_eq!(target.server, ServerId::ProgId("Vendor.AlarmServer.1".into()));
    assert_eq!(target.node, "scada01");
    assert_eq!(sub.buffer_time_ms, 250);
    assert_eq!(sub.max_size, 100);
    assert_eq!(sub.backpressure, Backpressure::DropNewest);

    let (target, sub) = resolve_server(&cfg, Some("lab")).unwrap();
    assert!(target.is_local());
    assert_eq!(
        sub.backpressure,
        Backpressure::Wait {
            timeout: Duration::from_millis(20)
        }
    );
}

#[test]
fn test_malformed_file_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "[defaults]\nbuffer_time_ms = \"soon\"\n");
    let err = load_config_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Figment(_)), "got {err:?}");
}

// ── Saving ──────────────────────────────────────────────────────────

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut cfg = Config {
        default_server: Some("plant".into()),
        ..Config::default()
    };
    cfg.defaults.queue_capacity = 32;
    cfg.servers.insert(
        "plant".into(),
        ServerProfile {
            prog_id: Some("Vendor.AlarmServer.1".into()),
            node: "scada01".into(),
            active: Some(false),
            ..ServerProfile::default()
        },
    );

    save_config_to(&cfg, &path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("[servers.plant]"), "{text}");

    let loaded = load_config_from(&path).unwrap();
    assert_eq!(loaded, cfg);
    let (_, sub) = resolve_server(&loaded, None).unwrap();
    assert!(!sub.active);
    assert_eq!(sub.queue_capacity, 32);
}
