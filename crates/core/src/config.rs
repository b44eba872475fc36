//! Configuration management for ossxfer

use crate::error::{Error, Result};
use crate::transfer::{TransferOptions, DEFAULT_PARALLEL_NUM, DEFAULT_PART_SIZE};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Configuration directory name
const CONFIG_DIR: &str = "ossxfer";

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub endpoint: EndpointConfig,
    pub transfer: Option<TransferConfig>,
    pub advanced: Option<AdvancedConfig>,
    pub logging: Option<LoggingConfig>,
}

/// Endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,

    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

/// Transfer defaults applied to every call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload/download part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Copy part size in bytes
    #[serde(default = "default_copy_part_size")]
    pub copy_part_size: u64,
    #[serde(default = "default_parallel_num")]
    pub parallel_num: usize,
    #[serde(default)]
    pub enable_checkpoint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub leave_parts_on_error: bool,
    #[serde(default)]
    pub verify_data: bool,
    #[serde(default = "default_enable_crc")]
    pub enable_crc: bool,
    #[serde(default)]
    pub disable_shallow_copy: bool,
    /// Seconds before a shallow copy falls back to multipart copy
    #[serde(default = "default_shallow_copy_timeout")]
    pub shallow_copy_timeout: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            copy_part_size: default_copy_part_size(),
            parallel_num: default_parallel_num(),
            enable_checkpoint: false,
            checkpoint_dir: None,
            leave_parts_on_error: false,
            verify_data: false,
            enable_crc: default_enable_crc(),
            disable_shallow_copy: false,
            shallow_copy_timeout: default_shallow_copy_timeout(),
        }
    }
}

impl TransferConfig {
    /// Writes the file settings into per-call options.
    ///
    /// `for_copy` selects `copy_part_size` instead of `part_size`.
    pub fn apply_to(&self, options: &mut TransferOptions, for_copy: bool) {
        options.part_size = if for_copy {
            self.copy_part_size
        } else {
            self.part_size
        };
        options.parallel_num = self.parallel_num;
        options.enable_checkpoint = self.enable_checkpoint;
        options.checkpoint_dir = self.checkpoint_dir.clone();
        options.leave_parts_on_error = self.leave_parts_on_error;
        options.verify_data = self.verify_data;
        options.enable_crc = self.enable_crc;
        options.disable_shallow_copy = self.disable_shallow_copy;
        options.shallow_copy_timeout = std::time::Duration::from_secs(self.shallow_copy_timeout);
    }
}

/// Advanced configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Per-attempt timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_copy_part_size() -> u64 {
    crate::transfer::DEFAULT_COPY_PART_SIZE
}

fn default_parallel_num() -> usize {
    DEFAULT_PARALLEL_NUM
}

fn default_enable_crc() -> bool {
    true
}

fn default_shallow_copy_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    Ok(home.join(".config").join(CONFIG_DIR))
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from a file
pub fn load_config_from(config_path: &std::path::Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Err(Error::ConfigNotFound(config_path.to_path_buf()));
    }

    let content = fs::read_to_string(config_path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config file: {}", e))
    })?;

    let config: ConfigFile = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config file: {}", e))
    })?;

    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &ConfigFile, config_path: &std::path::Path) -> Result<()> {
    if let Some(dir) = config_path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    let content = toml::to_string_pretty(config)?;

    fs::write(config_path, content).map_err(|e| {
        Error::Config(format!("Failed to write config file: {}", e))
    })?;

    // credentials live in this file
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(config_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(config_path, perms)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ConfigFile) -> Result<()> {
    let uri: http::Uri = config
        .endpoint
        .url
        .parse()
        .map_err(|e| Error::InvalidInput(format!("Invalid endpoint URL {:?}: {}", config.endpoint.url, e)))?;
    if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
        return Err(Error::InvalidInput(format!(
            "Endpoint URL must be http(s)://host, got {:?}",
            config.endpoint.url
        )));
    }

    if config.endpoint.access_key_id.is_none() || config.endpoint.secret_access_key.is_none() {
        return Err(Error::Config(
            "Both access_key_id and secret_access_key must be set".to_string(),
        ));
    }

    if let Some(transfer) = &config.transfer {
        if transfer.part_size == 0 || transfer.copy_part_size == 0 {
            return Err(Error::InvalidInput("Part size must be greater than 0".to_string()));
        }
        if transfer.parallel_num == 0 {
            return Err(Error::InvalidInput("parallel_num must be greater than 0".to_string()));
        }
    }

    Ok(())
}

/// Check if configuration exists
pub fn config_exists() -> bool {
    get_config_path().map(|p| p.exists()).unwrap_or(false)
}
