use serde::{Serialize, Deserialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use log::info;

mod merkle;
mod storage;
mod sync;

pub use merkle::MerkleConfig;
pub use storage::{StorageBackend, StorageConfig};
pub use sync::SyncConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or has invalid values
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of its allowed range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main configuration for a merkledb instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Trie configuration
    #[serde(default)]
    pub merkle: MerkleConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// State sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config_str = fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(config_str: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let config_str = toml::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    /// Generate a default configuration file if it doesn't exist
    pub fn generate_default<P: AsRef<Path>>(path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if path.exists() {
            info!("Config file already exists at {:?}", path);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        Config::default().save(path)?;
        info!("Generated default config at {:?}", path);
        Ok(())
    }

    /// Check value ranges the types alone do not enforce
    pub fn validate(&self) -> ConfigResult<()> {
        if self.merkle.history_length == 0 {
            return Err(ConfigError::Invalid("merkle.history_length must be at least 1".to_string()));
        }
        if self.sync.max_keys_per_request == 0 {
            return Err(ConfigError::Invalid("sync.max_keys_per_request must be at least 1".to_string()));
        }
        Ok(())
    }
}
