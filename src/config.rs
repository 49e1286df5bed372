//! Operator configuration
//!
//! Defaults, then an optional TOML file, then
//! `APPCTL_OPERATOR_<SECTION>__<KEY>` environment variables.

use crate::operator::{ControllerSettings, RetryPolicy};
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct OperatorConfig {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Namespace the front door and cache work in; empty for all
    pub namespace: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            namespace: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub requeue_secs: u64,
    pub resync_secs: u64,
    pub error_requeue_secs: u64,
    pub status_retry_attempts: u32,
    pub status_retry_backoff_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let settings = ControllerSettings::default();
        let retry = RetryPolicy::default();
        Self {
            requeue_secs: settings.requeue_interval.as_secs(),
            resync_secs: settings.resync_interval.as_secs(),
            error_requeue_secs: settings.error_requeue_interval.as_secs(),
            status_retry_attempts: retry.max_attempts,
            status_retry_backoff_ms: retry.initial_backoff.as_millis() as u64,
        }
    }
}

impl ControllerConfig {
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            requeue_interval: Duration::from_secs(self.requeue_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            error_requeue_interval: Duration::from_secs(self.error_requeue_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.status_retry_attempts,
            initial_backoff: Duration::from_millis(self.status_retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    pub reconnect_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub json: bool,
    /// Write daily-rotated files here in addition to stderr
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

/// Configuration loader with builder pattern
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    load_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of `appctl.toml` in the working directory
    pub fn load_from_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn build(self) -> Result<OperatorConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&OperatorConfig::default())?);

        builder = match &self.config_file {
            Some(path) => builder.add_source(File::from(path.as_path()).required(true)),
            None => builder.add_source(File::with_name("appctl").required(false)),
        };

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("APPCTL_OPERATOR")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let config: OperatorConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(config)
    }
}
