//! Configuration management for the node.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/lanrelay/config.toml`
//! - macOS: `~/Library/Application Support/lanrelay/config.toml`
//!
//! On first run no config file exists; the binary detects this and creates
//! one with a fresh `device_id` and the user's chosen device name.
//!
//! # Config File Format (TOML)
//!
//! ```toml
//! device_id = "550e8400-e29b-41d4-a716-446655440000"
//! device_name = "kitchen-pc"
//! platform = "pc"
//! tcp_port = 60000
//! udp_port = 50000
//! ```

use crate::types::{DeviceId, Platform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default TCP port for the peer-relay listener.
pub const DEFAULT_TCP_PORT: u16 = 60000;

/// Default UDP port for broadcast discovery.
pub const DEFAULT_UDP_PORT: u16 = 50000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}

/// The persisted configuration for this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Stable identifier for this node (UUID v4, generated once).
    pub device_id: String,

    /// Human-readable name for this node (chosen by user).
    pub device_name: String,

    /// The kind of device this node runs on.
    #[serde(default = "default_platform")]
    pub platform: Platform,

    /// TCP port for the peer-relay listener.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// UDP port for broadcast discovery.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

fn default_platform() -> Platform {
    Platform::Pc
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

impl AppConfig {
    /// Returns the platform-appropriate config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lanrelay"))
    }

    /// Returns the full path to the config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Returns the platform-appropriate data directory for history, group
    /// state, and received files.
    ///
    /// - Linux: `~/.local/share/lanrelay/`
    /// - macOS: `~/Library/Application Support/lanrelay/`
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("lanrelay"))
    }

    /// Returns the `data/` directory holding `state.json` and the
    /// append-only history logs.
    pub fn default_history_dir() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir().ok_or(ConfigError::NoConfigDir)?.join("data"))
    }

    /// Returns the `received/` directory for completed incoming files.
    pub fn default_received_dir() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("received"))
    }

    /// Loads the config from the default config file path.
    ///
    /// Returns `Ok(None)` if the config file doesn't exist yet (first run).
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    /// Loads the config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }

    /// Saves this config to the default config file path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    /// Saves this config to a specific file path, creating parent
    /// directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: path.to_owned(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    /// Creates a new config for first-run with a fresh device id.
    pub fn new_first_run(device_name: &str) -> Self {
        Self {
            device_id: DeviceId::generate().to_string(),
            device_name: device_name.to_string(),
            platform: Platform::Pc,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(device_id: &str, device_name: &str) -> AppConfig {
        AppConfig {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            platform: Platform::Pc,
            tcp_port: 60000,
            udp_port: 50000,
        }
    }

    #[test]
    fn config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let config = sample("test-device-id", "Sala");
        config.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap().unwrap();

        assert_eq!(loaded.device_id, "test-device-id");
        assert_eq!(loaded.device_name, "Sala");
        assert_eq!(loaded.tcp_port, 60000);
    }

    #[test]
    fn config_missing_file_returns_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nonexistent.toml");
        assert!(AppConfig::load_from(&path).unwrap().is_none());
    }

    #[test]
    fn config_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep").join("nested").join("config.toml");

        let config = AppConfig::new_first_run("test");
        config.save_to(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn config_accepts_missing_optional_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "device_id = \"abc\"\ndevice_name = \"minimal\"\n",
        )
        .unwrap();
        let loaded = AppConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(loaded.udp_port, DEFAULT_UDP_PORT);
        assert!(matches!(loaded.platform, Platform::Pc));
    }

    #[test]
    fn first_run_generates_unique_ids() {
        let a = AppConfig::new_first_run("A");
        let b = AppConfig::new_first_run("B");
        assert_ne!(a.device_id, b.device_id);
    }
}
