//! Configuration management for Turnstile.
//!
//! The configuration file is YAML. A handful of deployment-specific values
//! can be overridden from `TURNSTILE_*` environment variables:
//!
//! | Variable                 | Overrides                       |
//! |--------------------------|---------------------------------|
//! | `TURNSTILE_STORAGE_URL`  | `storage.url` (database, redis) |
//! | `TURNSTILE_LOG_LEVEL`    | `log.level`                     |
//! | `TURNSTILE_LOG_JSON`     | `log.json`                      |

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::{BackoffPolicy, RateLimiter, RateLimiterBackend, WindowPolicy};
use crate::redis_script::{RedisRateLimiter, DEFAULT_KEY_PREFIX};
use crate::settings::{BackoffSettings, PolicySettings, ResolvedPolicy};
use crate::storage::{DatabaseStorage, MemoryStorage};

const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Where rate limit records are kept
    #[serde(default)]
    pub storage: StorageConfig,

    /// Window policy settings
    #[serde(default)]
    pub policy: PolicySettings,

    /// Backoff settings
    #[serde(default)]
    pub backoff: BackoffSettings,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Process-local map; state is lost on exit
    #[default]
    Memory,

    /// SQLite database through sqlx
    Database { url: String },

    /// Redis server, updated through a server-side script
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Values read from the environment.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    storage_url: Option<String>,
    log_level: Option<String>,
    log_json: Option<bool>,
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| ThrottleError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, source: ::config::Environment) -> Result<()> {
        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ThrottleError::Config(e.to_string()))?;

        if let Some(url) = overrides.storage_url {
            match &mut self.storage {
                StorageConfig::Memory => {
                    return Err(ThrottleError::Config(
                        "TURNSTILE_STORAGE_URL is set but the memory storage takes no url".to_string(),
                    ))
                }
                StorageConfig::Database { url: current } | StorageConfig::Redis { url: current, .. } => {
                    *current = url;
                }
            }
        }
        if let Some(level) = overrides.log_level {
            self.log.level = level;
        }
        if let Some(json) = overrides.log_json {
            self.log.json = json;
        }
        Ok(())
    }

    /// Check that the limiter settings resolve.
    pub fn validate(&self) -> Result<()> {
        self.policy.resolve()?;
        self.backoff.resolve()?;
        Ok(())
    }

    /// Resolve the settings and connect the configured backend.
    pub async fn build_backend(&self) -> Result<Box<dyn RateLimiterBackend>> {
        let backoff = self.backoff.resolve()?;
        match self.policy.resolve()? {
            ResolvedPolicy::FixedWindow(policy) => connect(policy, backoff, &self.storage).await,
            ResolvedPolicy::SlidingWindow(policy) => connect(policy, backoff, &self.storage).await,
        }
    }
}

async fn connect<P: WindowPolicy>(
    policy: P,
    backoff: BackoffPolicy,
    storage: &StorageConfig,
) -> Result<Box<dyn RateLimiterBackend>> {
    let backend: Box<dyn RateLimiterBackend> = match storage {
        StorageConfig::Memory => Box::new(RateLimiter::new(policy, backoff, MemoryStorage::new())?),
        StorageConfig::Database { url } => {
            let storage = DatabaseStorage::connect(url).await?;
            Box::new(RateLimiter::new(policy, backoff, storage)?)
        }
        StorageConfig::Redis { url, key_prefix } => {
            let limiter = RedisRateLimiter::connect(url, policy, backoff).await?;
            Box::new(limiter.with_key_prefix(key_prefix.clone()))
        }
    };
    info!(storage = storage.kind(), "Rate limiter backend ready");
    Ok(backend)
}

impl StorageConfig {
    /// Short name of the backend, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::Database { .. } => "database",
            StorageConfig::Redis { .. } => "redis",
        }
    }
}
