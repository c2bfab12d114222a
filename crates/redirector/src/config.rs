//! Redirector configuration management

use anyhow::{Context, Result, anyhow};
use common::DEFAULT_CHANNEL_DEPTH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectorConfig {
    #[serde(default)]
    pub redirector: RedirectorSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectorSettings {
    #[serde(default = "RedirectorSettings::default_log_level")]
    pub log_level: String,
    /// Number the redirector instance ID is derived from
    #[serde(default)]
    pub instance_number: u32,
    /// Requests each queue holds before rejecting new ones
    #[serde(default = "RedirectorSettings::default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for RedirectorSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            instance_number: 0,
            queue_depth: Self::default_queue_depth(),
        }
    }
}

impl RedirectorSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_queue_depth() -> usize {
        DEFAULT_CHANNEL_DEPTH
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Device to redirect, as `VID:PID` (e.g. `0x046d:0xc52b`)
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Capacity of the USB worker command channel
    #[serde(default = "UsbSettings::default_worker_command_depth")]
    pub worker_command_depth: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            device: None,
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            worker_command_depth: Self::default_worker_command_depth(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_worker_command_depth() -> usize {
        DEFAULT_CHANNEL_DEPTH
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

impl RedirectorConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => [
                Self::default_path(),
                PathBuf::from("/etc/usb-redirector/redirector.toml"),
            ]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: RedirectorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(config_dir) => config_dir.join("usb-redirector").join("redirector.toml"),
            None => PathBuf::from(".config/usb-redirector/redirector.toml"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.redirector.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.redirector.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.redirector.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be at least 1"));
        }
        if self.usb.worker_command_depth == 0 {
            return Err(anyhow!("worker_command_depth must be at least 1"));
        }
        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than 0"));
        }

        if let Some(device) = &self.usb.device {
            Self::validate_filter(device)?;
        }
        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let Some((vid, pid)) = filter.split_once(':') else {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        };
        if pid.contains(':') {
            return Err(anyhow!("Invalid filter format '{}', too many fields", filter));
        }

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }
        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;
        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<RedirectorConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    RedirectorConfig::load(Some(path_buf))
}
