//! Configuration File Tests
//!
//! Run with: `cargo test -p redirector --test config_tests`

use redirector::RedirectorConfig;
use redirector::config::load_config;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("redirector.toml");

    let mut config = RedirectorConfig::default();
    config.redirector.instance_number = 4;
    config.redirector.log_level = "debug".to_string();
    config.usb.device = Some("0x046d:0xc52b".to_string());
    config.usb.transfer_timeout_ms = 250;

    config.save(&path).unwrap();
    let loaded = RedirectorConfig::load(Some(path)).unwrap();

    assert_eq!(loaded, config);
    assert_eq!(loaded.usb.transfer_timeout(), Duration::from_millis(250));
}

#[test]
fn test_partial_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redirector.toml");
    fs::write(&path, "[usb]\ndevice = \"0x1234:*\"\n").unwrap();

    let loaded = RedirectorConfig::load(Some(path)).unwrap();
    let defaults = RedirectorConfig::default();

    assert_eq!(loaded.usb.device.as_deref(), Some("0x1234:*"));
    assert_eq!(loaded.redirector, defaults.redirector);
    assert_eq!(loaded.usb.worker_command_depth, defaults.usb.worker_command_depth);
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();

    let cases = [
        "[redirector]\nlog_level = \"loud\"\n",
        "[redirector]\nqueue_depth = 0\n",
        "[usb]\ntransfer_timeout_ms = 0\n",
        "[usb]\ndevice = \"046d:c52b\"\n",
    ];
    for (n, content) in cases.iter().enumerate() {
        let path = dir.path().join(format!("bad{}.toml", n));
        fs::write(&path, content).unwrap();
        assert!(
            RedirectorConfig::load(Some(path)).is_err(),
            "accepted {:?}",
            content
        );
    }
}

#[test]
fn test_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redirector.toml");
    fs::write(&path, "[redirector\nlog_level = ").unwrap();

    let err = RedirectorConfig::load(Some(path)).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = load_config(dir.path().join("absent.toml").to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_load_config_plain_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redirector.toml");
    fs::write(&path, "[redirector]\ninstance_number = 9\n").unwrap();

    let loaded = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.redirector.instance_number, 9);
}
