use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Environment variable overriding the modpack home directory.
pub const HOME_ENV: &str = "MODPACK_HOME";

/// Name of the optional config file inside the home directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Modpack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Root directory for local state (content store, digest cache)
    pub storage_dir: PathBuf,

    /// Digest cache directory (defaults to `<storage_dir>/cache`)
    pub cache_dir: Option<PathBuf>,

    /// Number of files built or transferred in parallel
    pub concurrency: usize,

    /// Talk to registries over plain HTTP
    pub plain_http: bool,

    /// Accept invalid registry TLS certificates
    pub insecure: bool,

    /// Log level used when `RUST_LOG` is not set
    pub log_level: LogLevel,

    /// Upper bound on waiting for the digest cache lock
    pub lock_timeout_secs: u64,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_home(),
            cache_dir: None,
            concurrency: 1,
            plain_http: false,
            insecure: false,
            log_level: LogLevel::Warn,
            lock_timeout_secs: 5,
        }
    }
}

impl PackConfig {
    /// Load the config from `<home>/config.yaml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        let home = default_home();
        let mut config = Self::load_from(&home.join(CONFIG_FILE))?;
        if config.storage_dir.as_os_str().is_empty() {
            config.storage_dir = home;
        }
        Ok(config)
    }

    /// Load the config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: PackConfig = serde_yaml::from_str(&data).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        if config.concurrency == 0 {
            return Err(PackError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Directory holding the content store.
    pub fn content_dir(&self) -> PathBuf {
        self.storage_dir.join("content")
    }

    /// Directory holding the digest cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("cache"))
    }
}

/// Home directory: `$MODPACK_HOME`, else `~/.modpack`.
pub fn default_home() -> PathBuf {
    if let Ok(path) = std::env::var(HOME_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".modpack"))
        .unwrap_or_else(|| PathBuf::from(".modpack"))
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
