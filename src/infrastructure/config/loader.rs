use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = ".kubext/config.yaml";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "KUBEXT_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {field}: {value}. Must be at least 1")]
    InvalidWorkers { field: &'static str, value: usize },

    #[error("Invalid completed_pods_capacity: {0}. Must be at least 1")]
    InvalidCapacity(usize),

    #[error("Invalid {field}: 0. Resync period must be positive")]
    InvalidResync { field: &'static str },

    #[error("Invalid rate limit: {0}. Must be positive")]
    InvalidRateLimit(f64),

    #[error("Invalid burst_size: {0}. Must be at least 1")]
    InvalidBurstSize(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.kubext/config.yaml` in the working directory, when present
    /// 3. Environment variables (`KUBEXT_*`, nested keys split on `__`)
    pub fn load() -> Result<Config> {
        Self::load_layered(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit file, still honoring env overrides.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        Self::load_layered(path)
    }

    fn load_layered(path: &Path) -> Result<Config> {
        let config: Config = Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }
        if config.config_map.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "config_map cannot be empty".to_string(),
            ));
        }

        if config.workflow_workers == 0 {
            return Err(ConfigError::InvalidWorkers {
                field: "workflow_workers",
                value: config.workflow_workers,
            });
        }
        if config.pod_workers == 0 {
            return Err(ConfigError::InvalidWorkers {
                field: "pod_workers",
                value: config.pod_workers,
            });
        }
        if config.completed_pods_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(config.completed_pods_capacity));
        }
        if config.workflow_resync_secs == 0 {
            return Err(ConfigError::InvalidResync {
                field: "workflow_resync_secs",
            });
        }
        if config.pod_resync_secs == 0 {
            return Err(ConfigError::InvalidResync {
                field: "pod_resync_secs",
            });
        }

        if config.rate_limit.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(
                config.rate_limit.requests_per_second,
            ));
        }
        if config.rate_limit.burst_size == 0 {
            return Err(ConfigError::InvalidBurstSize(config.rate_limit.burst_size));
        }

        if config.requeue.initial_backoff_ms >= config.requeue.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.requeue.initial_backoff_ms,
                config.requeue.max_backoff_ms,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
