//! Configuration management for cryptmirror

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cache TTL for decrypted plaintext (seconds)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 2;

/// Default period of the cache sweeper thread (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 500;

/// Mirror configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Directory holding the encrypted backing files
    pub backing_dir: PathBuf,

    /// Read the encryption password from this file instead of prompting
    pub password_file: Option<PathBuf>,
}

/// Decrypted-content cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a cached plaintext snapshot stays alive without use
    pub ttl_secs: u64,

    /// Milliseconds between background eviction sweeps
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Refuse write-capable opens at the driver level
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/cryptmirror"),
            allow_other: false,
            allow_root: false,
            read_only: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Mirror configuration
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Mount configuration
    #[serde(default)]
    pub mount: MountConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cryptmirror")
        .join("config.json")
}

impl Config {
    /// Load configuration from a file, with environment variable
    /// overrides. Callers validate once command-line overrides are
    /// merged in.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Create a config from defaults plus environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CRYPTMIRROR_BACKING_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.mirror.backing_dir = PathBuf::from(dir);
            }
        }

        if let Ok(path) = std::env::var("CRYPTMIRROR_PASSWORD_FILE") {
            let path = path.trim();
            if !path.is_empty() {
                self.mirror.password_file = Some(PathBuf::from(path));
            }
        }

        if let Ok(ttl) = std::env::var("CRYPTMIRROR_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.trim().parse::<u64>() {
                self.cache.ttl_secs = secs;
            }
        }

        if let Ok(interval) = std::env::var("CRYPTMIRROR_SWEEP_INTERVAL_MS") {
            if let Ok(ms) = interval.trim().parse::<u64>() {
                self.cache.sweep_interval_ms = ms;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mirror.backing_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Backing directory is required".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if self.cache.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
