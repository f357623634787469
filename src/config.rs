//! Configuration of the keep client, read from a TOML file.
//!
//! ```toml
//! [client]
//! sanctioned_applications = ["0x0000000000000000000000000000000000000a11"]
//! registration_check_interval_blocks = 5
//!
//! [storage]
//! data_dir = "/var/lib/keep"
//! ```
use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::chain::Address;

/// Represents an error when loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub client: ClientConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Applications to register with as a member candidate.
    pub sanctioned_applications: Vec<Address>,
    /// Blocks between two checks of a pending registration.
    pub registration_check_interval_blocks: u64,
    pub announce_timeout_secs: u64,
    pub protocol_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sanctioned_applications: Vec::new(),
            registration_check_interval_blocks: 5,
            announce_timeout_secs: 60,
            protocol_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(self.announce_timeout_secs)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_secs(self.protocol_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;
        if client.registration_check_interval_blocks == 0 {
            return Err(ConfigError::Invalid {
                key: "client.registration_check_interval_blocks",
                reason: "must be at least 1".to_string(),
            });
        }
        if client.announce_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "client.announce_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if client.protocol_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "client.protocol_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        let mut applications = client.sanctioned_applications.clone();
        applications.sort();
        applications.dedup();
        if applications.len() != client.sanctioned_applications.len() {
            return Err(ConfigError::Invalid {
                key: "client.sanctioned_applications",
                reason: "applications must be unique".to_string(),
            });
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "storage.data_dir",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
