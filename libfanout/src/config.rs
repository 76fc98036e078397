//! Configuration management for Fanout
//!
//! Configuration is read from a TOML file. Every section has defaults, so an
//! empty file (or one containing only the app credentials) is valid.
//!
//! ```toml
//! [database]
//! path = "~/.local/share/fanout/fanout.db"
//!
//! [vault]
//! identity_file = "~/.config/fanout/vault.key"
//!
//! [retry]
//! backoff_secs = [30, 120, 600]
//! max_attempts = 3
//!
//! [apps.twitter]
//! client_id = "..."
//! client_secret = "..."
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    pub retry: RetryConfig,
    pub tokens: TokenConfig,
    pub media: MediaConfig,
    pub worker: WorkerConfig,
    pub apps: AppsConfig,
    pub endpoints: EndpointsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/fanout/fanout.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// File holding the age identity (`AGE-SECRET-KEY-...`) used for credentials
    pub identity_file: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            identity_file: "~/.config/fanout/vault.key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before retry N, indexed by attempt number; the last value repeats
    pub backoff_secs: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: vec![30, 120, 600],
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Tokens expiring within this window are refreshed before use
    pub refresh_margin_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Maximum number of processing-status checks per media item
    pub poll_attempts: u32,
    /// Delay between checks when the platform does not suggest one
    pub poll_interval_secs: u64,
    /// HTTP request timeout for platform calls
    pub request_timeout_secs: u64,
}

impl MediaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 30,
            poll_interval_secs: 5,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    /// Maximum number of due jobs processed concurrently per poll
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            batch_size: 20,
        }
    }
}

/// OAuth application credentials, one set per vendor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// Shared by Facebook and Instagram
    pub meta: Option<AppCredentials>,
    pub twitter: Option<AppCredentials>,
    pub tiktok: Option<AppCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Base URLs for the platform APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub graph: String,
    pub linkedin: String,
    pub twitter_api: String,
    pub twitter_upload: String,
    pub tiktok: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            graph: "https://graph.facebook.com/v19.0".to_string(),
            linkedin: "https://api.linkedin.com/v2".to_string(),
            twitter_api: "https://api.twitter.com".to_string(),
            twitter_upload: "https://upload.twitter.com".to_string(),
            tiktok: "https://open.tiktokapis.com".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.backoff_secs.is_empty() {
            return Err(ConfigError::MissingField("retry.backoff_secs".to_string()).into());
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::MissingField(
                "retry.max_attempts (must be at least 1)".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Database path with `~` and environment variables expanded
    pub fn database_path(&self) -> String {
        shellexpand::tilde(&self.database.path).to_string()
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}
