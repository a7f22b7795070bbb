//! Daemon configuration: CLI flags merged over an optional JSON file.
//!
//! CLI flags win over config-file values, which win over defaults.

use std::path::{Path, PathBuf};

use pigeon_link::lan::DEFAULT_DISCOVERY_PORT;
use pigeon_types::{MeshConfig, PigeonError, Result};
use serde::{Deserialize, Serialize};

use crate::Cli;

/// Default data directory, relative to the working directory.
const DEFAULT_DATA_DIR: &str = "pigeon-data";

/// Default cadence of the collector reachability probe, in seconds.
pub const DEFAULT_PROBE_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Fully resolved daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory for the sled database.
    pub data_dir: PathBuf,
    /// Display name override; `None` keeps the stored or default name.
    pub device_name: Option<String>,
    /// Collector endpoint, e.g. `https://collector.example.org/api/messages`.
    pub collector_endpoint: Option<String>,
    /// UDP port for LAN discovery beacons.
    pub discovery_port: u16,
    /// Cadence of the collector reachability probe in seconds.
    pub probe_secs: u64,
    /// Mesh protocol parameters.
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            device_name: None,
            collector_endpoint: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            probe_secs: DEFAULT_PROBE_SECS,
            mesh: MeshConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::ConfigError`] if the file cannot be read
    /// or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PigeonError::ConfigError {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| PigeonError::ConfigError {
            reason: format!("failed to parse config file {}: {e}", path.display()),
        })
    }

    /// Applies CLI overrides on top of this config.
    pub fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if cli.device_name.is_some() {
            self.device_name = cli.device_name.clone();
        }
        if cli.collector.is_some() {
            self.collector_endpoint = cli.collector.clone();
        }
        if let Some(port) = cli.discovery_port {
            self.discovery_port = port;
        }
        if let Some(secs) = cli.probe_secs {
            self.probe_secs = secs;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = DaemonConfig::default();
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.probe_secs, DEFAULT_PROBE_SECS);
        assert!(config.mesh.validate().is_ok());
    }

    #[test]
    fn file_roundtrip() -> Result<()> {
        let config = DaemonConfig {
            collector_endpoint: Some("https://collector.example.org/api/messages".into()),
            ..DaemonConfig::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();

        let dir = std::env::temp_dir().join("pigeon-daemon-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, json).unwrap();

        let loaded = DaemonConfig::load(&path)?;
        assert_eq!(loaded.collector_endpoint, config.collector_endpoint);
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn missing_file_is_config_error() {
        let result = DaemonConfig::load(Path::new("/nonexistent/pigeon.json"));
        assert!(matches!(result, Err(PigeonError::ConfigError { .. })));
    }
}
