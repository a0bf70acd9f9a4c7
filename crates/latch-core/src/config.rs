//! Configuration for latch nodes.
//!
//! Configuration lives in a single TOML file, `~/.latch/config.toml` by
//! default. The location can be overridden with the `LATCH_CONFIG_PATH`
//! environment variable, and individual settings with the `LATCH_*`
//! variables listed below.
//!
//! ```toml
//! [general]
//! version = "0.1.0"
//! log_level = "info"
//!
//! [provider]
//! application_id = "shop"
//!
//! [store]
//! shard_amount = 64
//! ```
//!
//! # Example
//!
//! ```no_run
//! use latch_core::config::LatchConfig;
//!
//! # async fn example() -> latch_core::Result<()> {
//! let config = LatchConfig::load_or_default().await?;
//! println!("Shards: {}", config.store().shard_amount);
//! # Ok(())
//! # }
//! ```

use crate::error::{LatchError, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// The current configuration version
pub const CONFIG_VERSION: &str = "0.1.0";

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "LATCH_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "LATCH_LOG_LEVEL";
pub const ENV_APPLICATION_ID: &str = "LATCH_APPLICATION_ID";
pub const ENV_NODE_ID: &str = "LATCH_NODE_ID";
pub const ENV_STORE_SHARDS: &str = "LATCH_STORE_SHARDS";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatchConfig {
    #[serde(default)]
    general: GeneralConfig,
    #[serde(default)]
    provider: ProviderConfig,
    #[serde(default)]
    store: StoreConfig,
}

/// General configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Configuration version
    pub version: String,
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

/// Session-state provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Prefix separating sessions of different applications sharing one cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    /// Fixed node identity; a random one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
}

/// In-memory store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of lock shards; must be a power of two greater than one
    pub shard_amount: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            application_id: None,
            node_id: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { shard_amount: 64 }
    }
}

impl LatchConfig {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path).await
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied before validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LatchError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::import_toml(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded successfully from {}", path.display());
        Ok(config)
    }

    /// Load configuration from the default location, falling back to defaults
    /// (plus environment overrides) when no file exists
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid
    pub async fn load_or_default() -> Result<Self> {
        let config_path = Self::config_path()?;

        if tokio::fs::try_exists(&config_path).await? {
            Self::load_from_path(&config_path).await
        } else {
            debug!("No configuration at {}, using defaults", config_path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Save configuration to a specific path atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or cannot be written
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    LatchError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.export_toml()?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");

        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| LatchError::Config(format!("Failed to write config file: {}", e)))?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| LatchError::Config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved successfully to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(LatchError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if let Some(application_id) = &self.provider.application_id {
            if application_id.is_empty() || application_id.contains('.') {
                return Err(LatchError::Config(format!(
                    "Invalid application_id '{}': must be non-empty and contain no '.'",
                    application_id
                )));
            }
        }

        let shards = self.store.shard_amount;
        if shards < 2 || !shards.is_power_of_two() {
            return Err(LatchError::Config(format!(
                "shard_amount must be a power of two greater than 1, got {}",
                shards
            )));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|name| std::env::var(name).ok())
    }

    /// Merge overrides from an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unparsable value
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.general.log_level = log_level;
        }

        if let Some(application_id) = lookup(ENV_APPLICATION_ID) {
            debug!("Overriding application_id from environment: {}", application_id);
            self.provider.application_id = Some(application_id);
        }

        if let Some(node_id) = lookup(ENV_NODE_ID) {
            let node_id = Uuid::parse_str(&node_id).map_err(|e| {
                LatchError::Config(format!("Invalid node id in environment: {}", e))
            })?;
            debug!("Overriding node_id from environment: {}", node_id);
            self.provider.node_id = Some(node_id);
        }

        if let Some(shards) = lookup(ENV_STORE_SHARDS) {
            let shards = shards.parse::<usize>().map_err(|e| {
                LatchError::Config(format!("Invalid shard amount in environment: {}", e))
            })?;
            debug!("Overriding shard_amount from environment: {}", shards);
            self.store.shard_amount = shards;
        }

        Ok(())
    }

    /// Get the configuration file path (`~/.latch/config.toml`)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(config_path));
        }

        let base_dirs = BaseDirs::new()
            .ok_or_else(|| LatchError::Config("Could not determine home directory".to_string()))?;

        Ok(base_dirs.home_dir().join(".latch").join("config.toml"))
    }

    /// Export configuration as TOML
    pub fn export_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LatchError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Import configuration from TOML (not validated)
    pub fn import_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| LatchError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn general(&self) -> &GeneralConfig {
        &self.general
    }

    pub fn general_mut(&mut self) -> &mut GeneralConfig {
        &mut self.general
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut ProviderConfig {
        &mut self.provider
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StoreConfig {
        &mut self.store
    }
}
