//! Configuration management for the wadb client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/wadb/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("read_timeout_secs must be between 1 and 300, got {0}")]
    InvalidReadTimeout(u64),

    #[error("idle_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("device_name must be non-empty and at most 64 bytes, got {0:?}")]
    InvalidDeviceName(String),
}

/// Main configuration structure for the wadb client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Path to the PKCS#8 private key file.
    pub key_path: PathBuf,

    /// Device name advertised alongside the public key during
    /// authentication and pairing.
    pub device_name: String,

    /// Per-frame socket read timeout in seconds.
    pub read_timeout_secs: u64,

    /// Seconds an unused connection stays cached before teardown.
    pub idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            device_name: "wadb".to_string(),
            read_timeout_secs: 10,
            idle_timeout_secs: 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wadb")
        .join("config.toml")
}

/// Returns the default private key file path.
fn default_key_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wadb")
        .join("adbkey")
}

impl Config {
    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_secs < 1 || self.read_timeout_secs > 300 {
            return Err(ConfigError::InvalidReadTimeout(self.read_timeout_secs));
        }
        if self.idle_timeout_secs < 1 || self.idle_timeout_secs > 3600 {
            return Err(ConfigError::InvalidIdleTimeout(self.idle_timeout_secs));
        }
        if self.device_name.is_empty() || self.device_name.len() > 64 {
            return Err(ConfigError::InvalidDeviceName(self.device_name.clone()));
        }
        Ok(())
    }

    /// The per-frame read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// The idle disconnect timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path
    /// (`~/.config/wadb/config.toml`).
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {e}"))
    }

    /// Save configuration to a file, creating parent directories if needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.device_name, "wadb");
        assert_eq!(config.read_timeout_secs, 10);
        assert_eq!(config.idle_timeout_secs, 60);
        assert!(config.key_path.to_string_lossy().contains("wadb"));
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
device_name = "workstation"
idle_timeout_secs = 120
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.device_name, "workstation");
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.read_timeout_secs, 10);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
key_path = "/custom/keys/adbkey"
device_name = "laptop"
read_timeout_secs = 5
idle_timeout_secs = 30
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.key_path, PathBuf::from("/custom/keys/adbkey"));
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.read_timeout_secs, 5);
        assert_eq!(config.idle_timeout_secs, 30);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        assert!(Config::from_toml("device_name = [").is_err());
    }

    #[test]
    fn test_from_toml_wrong_type() {
        assert!(Config::from_toml("read_timeout_secs = \"ten\"").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.device_name = "roundtrip".to_string();
        original.read_timeout_secs = 7;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.idle_timeout_secs = 45;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate_read_timeout_zero() {
        let mut config = Config::default();
        config.read_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadTimeout(0)));
    }

    #[test]
    fn test_validate_idle_timeout_too_high() {
        let mut config = Config::default();
        config.idle_timeout_secs = 3601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidIdleTimeout(3601))
        );
    }

    #[test]
    fn test_validate_empty_device_name() {
        let mut config = Config::default();
        config.device_name = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceName(_))
        ));
    }

    #[test]
    fn test_validate_oversized_device_name() {
        let mut config = Config::default();
        config.device_name = "x".repeat(65);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_boundary_values() {
        let mut config = Config::default();

        config.read_timeout_secs = 1;
        config.idle_timeout_secs = 1;
        assert!(config.validate().is_ok());

        config.read_timeout_secs = 300;
        config.idle_timeout_secs = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("wadb"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }
}
