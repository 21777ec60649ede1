//! Configuration management for the restore agent.
//!
//! Loads configuration from a TOML file; command-line flags override it.

use crate::executor::DEFAULT_MAX_ATTEMPTS;
use crate::manifest::resolver::LogScan;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket holding the backups
    #[serde(default)]
    pub bucket: String,

    /// Region override (otherwise taken from the AWS environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style addressing (needed by most S3-compatible services)
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Number of download workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per file before giving up on it
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Re-download files even when the local copy has the right size
    #[serde(default)]
    pub force: bool,

    /// Restore the owner recorded in object metadata when present
    #[serde(default)]
    pub preserve_ownership: bool,

    /// Owner applied when not preserving (or nothing was recorded)
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Group applied when not preserving (or nothing was recorded)
    #[serde(default = "default_owner")]
    pub group: String,

    /// How commit-log segments are matched against the watermark
    #[serde(default)]
    pub commitlog_scan: LogScan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_owner() -> String {
    "cassandra".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            force: false,
            preserve_ownership: false,
            owner: default_owner(),
            group: default_owner(),
            commitlog_scan: LogScan::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
