//! Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./weft.yaml` (current directory - highest priority)
//! 2. `~/.config/weft/weft.yaml` (user config directory)
//! 3. `/etc/weft/weft.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. Every field is optional; accessors supply the defaults.

use crate::chunker::{DEFAULT_MAX_INFLIGHT, DEFAULT_TRANSFER_EXPIRY_MS};
use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::identity::DEFAULT_NICKNAME;
use crate::link::UdpLinkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "weft.yaml";

/// Default channel buffer for events and link frames.
const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Default keystore directory, relative to the working directory.
const DEFAULT_KEYSTORE_DIR: &str = "weft-keys";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Node configuration (`node.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSection {
    /// Nickname announced to the mesh (`node.nickname`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Fingerprint cache capacity for duplicate suppression
    /// (`node.dedup_capacity`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_capacity: Option<usize>,

    /// Buffer size for the event and link channels (`node.channel_buffer`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_buffer: Option<usize>,
}

/// Keystore configuration (`keystore.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoreSection {
    /// Directory holding the persisted secret keys (`keystore.path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Transfer hygiene configuration (`transfer.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    /// Seconds before an incomplete transfer is dropped
    /// (`transfer.expiry_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_secs: Option<u64>,

    /// Cap on concurrently reassembling transfers
    /// (`transfer.max_inflight`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inflight: Option<usize>,
}

/// Link driver configuration (`link.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSection {
    /// UDP stand-in radio (`link.udp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpLinkConfig>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeSection,

    /// Keystore configuration (`keystore.*`).
    #[serde(default)]
    pub keystore: KeystoreSection,

    /// Transfer hygiene (`transfer.*`).
    #[serde(default)]
    pub transfer: TransferSection,

    /// Link drivers (`link.*`).
    #[serde(default)]
    pub link: LinkSection,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns the
    /// merged config and the paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths, later paths overriding
    /// earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/weft").join(CONFIG_FILENAME));

        // User config
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("weft")
                    .join(CONFIG_FILENAME),
            );
        }

        // Working directory (highest priority)
        paths.push(PathBuf::from(CONFIG_FILENAME));

        paths
    }

    /// Overlay `other` onto this config. Set fields in `other` win.
    pub fn merge(&mut self, other: Config) {
        if other.node.nickname.is_some() {
            self.node.nickname = other.node.nickname;
        }
        if other.node.dedup_capacity.is_some() {
            self.node.dedup_capacity = other.node.dedup_capacity;
        }
        if other.node.channel_buffer.is_some() {
            self.node.channel_buffer = other.node.channel_buffer;
        }
        if other.keystore.path.is_some() {
            self.keystore.path = other.keystore.path;
        }
        if other.transfer.expiry_secs.is_some() {
            self.transfer.expiry_secs = other.transfer.expiry_secs;
        }
        if other.transfer.max_inflight.is_some() {
            self.transfer.max_inflight = other.transfer.max_inflight;
        }
        if other.link.udp.is_some() {
            self.link.udp = other.link.udp;
        }
    }

    // === Accessors with defaults ===

    /// Nickname to announce.
    pub fn nickname(&self) -> &str {
        self.node.nickname.as_deref().unwrap_or(DEFAULT_NICKNAME)
    }

    /// Dedup cache capacity.
    pub fn dedup_capacity(&self) -> usize {
        self.node.dedup_capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY)
    }

    /// Event and link channel buffer size.
    pub fn channel_buffer(&self) -> usize {
        self.node.channel_buffer.unwrap_or(DEFAULT_CHANNEL_BUFFER)
    }

    /// Keystore directory.
    pub fn keystore_path(&self) -> PathBuf {
        self.keystore
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE_DIR))
    }

    /// Incomplete-transfer lifetime in milliseconds.
    pub fn transfer_expiry_ms(&self) -> u64 {
        self.transfer
            .expiry_secs
            .map(|s| s * 1000)
            .unwrap_or(DEFAULT_TRANSFER_EXPIRY_MS)
    }

    /// Cap on concurrently reassembling transfers.
    pub fn transfer_max_inflight(&self) -> usize {
        self.transfer.max_inflight.unwrap_or(DEFAULT_MAX_INFLIGHT)
    }

    /// UDP link configuration, defaulted when absent.
    pub fn udp_link(&self) -> UdpLinkConfig {
        self.link.udp.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.nickname(), "anon");
        assert_eq!(config.dedup_capacity(), DEFAULT_DEDUP_CAPACITY);
        assert_eq!(config.transfer_expiry_ms(), DEFAULT_TRANSFER_EXPIRY_MS);
        assert_eq!(config.transfer_max_inflight(), DEFAULT_MAX_INFLIGHT);
        assert_eq!(config.keystore_path(), PathBuf::from("weft-keys"));
        assert_eq!(config.udp_link().bind_addr, "0.0.0.0:4810");
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
node:
  nickname: "alice"
  dedup_capacity: 8192
keystore:
  path: "/var/lib/weft/keys"
transfer:
  expiry_secs: 120
  max_inflight: 8
link:
  udp:
    bind_addr: "0.0.0.0:5000"
    mtu: 1200
    neighbors:
      - "10.0.0.2:5000"
      - "10.0.0.3:5000"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.nickname(), "alice");
        assert_eq!(config.dedup_capacity(), 8192);
        assert_eq!(config.transfer_expiry_ms(), 120_000);
        assert_eq!(config.transfer_max_inflight(), 8);
        assert_eq!(config.udp_link().neighbors.len(), 2);
        assert_eq!(config.udp_link().mtu, 1200);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str("node:\n  nickname: bob\n").unwrap();
        assert_eq!(config.nickname(), "bob");
        assert_eq!(config.dedup_capacity(), DEFAULT_DEDUP_CAPACITY);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base: Config =
            serde_yaml::from_str("node:\n  nickname: base\n  dedup_capacity: 2048\n").unwrap();
        let overlay: Config = serde_yaml::from_str("node:\n  nickname: overlay\n").unwrap();

        base.merge(overlay);
        assert_eq!(base.nickname(), "overlay");
        assert_eq!(base.dedup_capacity(), 2048);
    }

    #[test]
    fn test_load_from_paths_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let low = dir.path().join("low.yaml");
        let high = dir.path().join("high.yaml");
        std::fs::write(&low, "node:\n  nickname: low\n  dedup_capacity: 2048\n").unwrap();
        std::fs::write(&high, "node:\n  nickname: high\n").unwrap();

        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), high.clone(), dir.path().join("missing.yaml")])
                .unwrap();

        assert_eq!(loaded, vec![low, high]);
        assert_eq!(config.nickname(), "high");
        assert_eq!(config.dedup_capacity(), 2048);
    }

    #[test]
    fn test_bad_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "node: [not, a, mapping\n").unwrap();

        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_search_paths_order() {
        let paths = Config::search_paths();
        assert!(paths[0].starts_with("/etc/weft"));
        assert_eq!(paths.last().unwrap(), &PathBuf::from("weft.yaml"));
    }
}
