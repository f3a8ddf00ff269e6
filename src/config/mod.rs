//! Configuration module.
//!
//! TOML-based configuration with environment variable overrides
//! (`RELAYMQ_*` prefix) and `${VAR}` / `${VAR:-default}` substitution in
//! the file body.
//!
//! Sections:
//! - `[store]`: backend choice, data path, cluster node addresses
//! - `[sync]`: broadcast channel name and convergence retry delay
//! - `[ttl]`: subscriptions / packets time-to-live and the reconciliation
//!   sweep frequency

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store backend configuration
    pub store: StoreConfig,
    /// Cluster sync configuration
    pub sync: SyncConfig,
    /// Time-to-live configuration
    pub ttl: TtlConfig,
}

impl Config {
    /// Load configuration from a TOML file with `RELAYMQ_*` environment
    /// overrides (e.g. `RELAYMQ_SYNC__CHANNEL`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let settings = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("RELAYMQ").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.channel.is_empty() {
            return Err(ConfigError::Validation(
                "sync.channel cannot be empty".to_string(),
            ));
        }
        if self.ttl.subscriptions.is_zero() {
            return Err(ConfigError::Validation(
                "ttl.subscriptions must be greater than zero".to_string(),
            ));
        }
        if self.ttl.packets.is_zero() {
            return Err(ConfigError::Validation(
                "ttl.packets must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backend type for the shared state store
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process store (tests, embedded single-process deployments)
    Memory,
    /// Fjall (local LSM-tree storage)
    #[default]
    Fjall,
}

/// Store backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: BackendType,

    /// Data directory path (for fjall)
    pub path: PathBuf,

    /// Cluster node addresses, "host:port".
    /// Consumed by networked store backends; unused by the local ones.
    pub nodes: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            nodes: Vec::new(),
        }
    }
}

fn default_channel() -> String {
    "relaymq:sync".to_string()
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

/// Cluster sync configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Broadcast channel carrying sync notices
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Delay before the single retry of a sync read that found no record.
    /// A tunable convergence knob, not a consistency guarantee.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_subscriptions_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_packets_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_check_frequency() -> Duration {
    Duration::from_secs(60)
}

/// Time-to-live configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Subscription record TTL
    #[serde(default = "default_subscriptions_ttl", with = "humantime_serde")]
    pub subscriptions: Duration,

    /// Offline packet TTL, applied at enqueue time
    #[serde(default = "default_packets_ttl", with = "humantime_serde")]
    pub packets: Duration,

    /// How often the reconciliation sweep prunes matcher entries whose
    /// backing record expired. Zero disables the sweep.
    #[serde(default = "default_check_frequency", with = "humantime_serde")]
    pub check_frequency: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            subscriptions: default_subscriptions_ttl(),
            packets: default_packets_ttl(),
            check_frequency: default_check_frequency(),
        }
    }
}
