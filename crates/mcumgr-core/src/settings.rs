//! Upgrade configuration.
//!
//! [`UpgradeConfig`] is the serializable form (TOML on disk); it validates
//! into the [`UpgradeSettings`] the transfer engine runs with.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transfer tuning, validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSettings {
    window_capacity: usize,
    memory_alignment: usize,
}

impl UpgradeSettings {
    pub fn new(window_capacity: usize, memory_alignment: usize) -> Result<Self, Error> {
        if window_capacity == 0 {
            return Err(Error::InvalidSettings("window capacity must be at least 1".into()));
        }
        if memory_alignment == 0 {
            return Err(Error::InvalidSettings("memory alignment must be at least 1".into()));
        }
        Ok(Self {
            window_capacity,
            memory_alignment,
        })
    }

    /// Maximum chunks in flight.
    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    /// Chunk sizes are multiples of this, except the last.
    pub fn memory_alignment(&self) -> usize {
        self.memory_alignment
    }
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            window_capacity: 1,
            memory_alignment: 1,
        }
    }
}

/// What the legacy flow does after the device comes back from reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeMode {
    /// Confirm the new image permanently.
    #[default]
    TestAndConfirm,
    /// Leave the image in test state; the bootloader reverts on next reset
    /// unless the application confirms itself.
    TestOnly,
}

/// Bounded poll after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetPollConfig {
    /// Wait before the first poll, covering the device reboot and the
    /// transport's reconnect delay.
    pub initial_delay_ms: u64,
    /// Wait between subsequent polls.
    pub interval_ms: u64,
    /// Polls after the first one before giving up.
    pub max_retries: u32,
}

impl ResetPollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ResetPollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 21_000,
            interval_ms: 5_000,
            max_retries: 4,
        }
    }
}

/// Configuration for an upgrade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Upload chunks kept in flight.
    pub window_capacity: usize,
    /// Flash write alignment of the target, in bytes.
    pub memory_alignment: usize,
    pub mode: UpgradeMode,
    /// Image index for multi-image devices.
    pub image: u32,
    pub reset_poll: ResetPollConfig,
    /// Wait before asking a SUIT device for its next missing resource.
    pub manifest_poll_delay_ms: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            window_capacity: 1,
            memory_alignment: 1,
            mode: UpgradeMode::default(),
            image: 0,
            reset_poll: ResetPollConfig::default(),
            manifest_poll_delay_ms: 1_000,
        }
    }
}

impl UpgradeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpgradeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn settings(&self) -> Result<UpgradeSettings, Error> {
        UpgradeSettings::new(self.window_capacity, self.memory_alignment)
    }

    pub fn manifest_poll_delay(&self) -> Duration {
        Duration::from_millis(self.manifest_poll_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_reject_zero() {
        assert!(matches!(
            UpgradeSettings::new(0, 4),
            Err(Error::InvalidSettings(_))
        ));
        assert!(UpgradeSettings::new(3, 0).is_err());
        let settings = UpgradeSettings::new(3, 4).unwrap();
        assert_eq!(settings.window_capacity(), 3);
        assert_eq!(settings.memory_alignment(), 4);
    }

    #[test]
    fn test_defaults() {
        let config = UpgradeConfig::default();
        assert_eq!(config.settings().unwrap(), UpgradeSettings::default());
        assert_eq!(config.mode, UpgradeMode::TestAndConfirm);
        assert_eq!(config.reset_poll.initial_delay(), Duration::from_secs(21));
        assert_eq!(config.reset_poll.interval(), Duration::from_secs(5));
        assert_eq!(config.reset_poll.max_retries, 4);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: UpgradeConfig = toml::from_str(
            r#"
            window_capacity = 4
            mode = "test_only"

            [reset_poll]
            interval_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.window_capacity, 4);
        assert_eq!(config.memory_alignment, 1);
        assert_eq!(config.mode, UpgradeMode::TestOnly);
        assert_eq!(config.reset_poll.interval_ms, 100);
        assert_eq!(config.reset_poll.initial_delay_ms, 21_000);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let path = std::env::temp_dir().join(format!("mcumgr-config-{}.toml", std::process::id()));
        let config = UpgradeConfig {
            memory_alignment: 8,
            manifest_poll_delay_ms: 250,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = UpgradeConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
