//! Daemon configuration.
//!
//! Loads YAML files with a cascading priority system:
//! 1. `./akari.yaml` (current directory - highest priority)
//! 2. `~/.config/akari/akari.yaml` (user config directory)
//! 3. `/etc/akari/akari.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files, section by section.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::server::ResponderPolicy;

/// Default config filename.
const CONFIG_FILENAME: &str = "akari.yaml";

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

    #[error("psk is not valid hex: {0}")]
    PskHex(hex::FromHexError),

    #[error("no pre-shared key configured")]
    MissingPsk,
}

/// Responder bind address (`remote.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    14500
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Responder reliability policy (`policy.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub require_encryption: bool,
    /// Response retention window for retransmits, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_cache_ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu_budget: Option<usize>,
    #[serde(default)]
    pub parity_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_duplication: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_duplication: Option<u8>,
}

impl PolicySection {
    /// Expand into the engine policy, falling back to engine defaults.
    pub fn to_policy(&self) -> ResponderPolicy {
        let defaults = ResponderPolicy::default();
        ResponderPolicy {
            require_encryption: self.require_encryption,
            resp_cache_ttl: self
                .resp_cache_ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.resp_cache_ttl),
            mtu_budget: self.mtu_budget.unwrap_or(defaults.mtu_budget),
            parity_enabled: self.parity_enabled,
            head_duplication: self.head_duplication.unwrap_or(defaults.head_duplication),
            body_duplication: self.body_duplication.unwrap_or(defaults.body_duplication),
        }
    }
}

/// Initiator defaults (`client.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nack_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_request_retries: Option<u32>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub aggregate_tag: bool,
    #[serde(default)]
    pub short_identifier: bool,
}

impl ClientSection {
    pub fn to_request_config(&self) -> crate::client::RequestConfig {
        let mut config = crate::client::RequestConfig::default();
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(rounds) = self.max_nack_rounds {
            config.max_nack_rounds = rounds;
        }
        if let Some(retries) = self.initial_request_retries {
            config.initial_request_retries = retries;
        }
        config
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.encrypt {
            flags |= crate::wire::FLAG_ENCRYPT;
        }
        if self.aggregate_tag {
            flags |= crate::wire::FLAG_AGG_TAG;
        }
        if self.short_identifier {
            flags |= crate::wire::FLAG_SHORT_ID;
        }
        flags
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pre-shared key as UTF-8 text (`psk`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,

    /// Pre-shared key as hex (`psk_hex`); takes precedence over `psk`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk_hex: Option<String>,

    /// Responder bind address (`remote.*`).
    #[serde(default)]
    pub remote: RemoteSection,

    /// Responder policy (`policy.*`).
    #[serde(default)]
    pub policy: PolicySection,

    /// Initiator defaults (`client.*`).
    #[serde(default)]
    pub client: ClientSection,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths, lowest priority
    /// first, merging as it goes. Returns the merged config and the paths
    /// that were actually loaded.
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

    /// Standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/akari").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("akari").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Overlay another config; present values win.
    pub fn merge(&mut self, other: Config) {
        if other.psk.is_some() {
            self.psk = other.psk;
        }
        if other.psk_hex.is_some() {
            self.psk_hex = other.psk_hex;
        }
        self.remote = other.remote;
        self.policy = other.policy;
        self.client = other.client;
    }

    /// Resolve the pre-shared key bytes.
    pub fn psk_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        if let Some(hex_str) = &self.psk_hex {
            return hex::decode(hex_str).map_err(ConfigError::PskHex);
        }
        self.psk
            .as_ref()
            .map(|s| s.as_bytes().to_vec())
            .ok_or(ConfigError::MissingPsk)
    }

    pub fn has_psk(&self) -> bool {
        self.psk.is_some() || self.psk_hex.is_some()
    }
}
