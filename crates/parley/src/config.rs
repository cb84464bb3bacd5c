//! Client configuration.
//!
//! Layered like the rest of our tooling: built-in defaults, then an optional
//! TOML file, then `PARLEY__*` environment variables (`__` separates nested
//! keys, e.g. `PARLEY__FEED__MAX_BACKOFF_MS`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::FeedConfig;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PARLEY";

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] config::ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the chat API (e.g., "http://localhost:8000").
    pub base_url: String,
    /// WebSocket base URL. Derived from `base_url` when unset.
    pub ws_url: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Path of the setup document carrying the service epoch.
    pub setup_path: String,
    /// Delay between setup document fetch attempts, in milliseconds.
    pub epoch_retry_ms: u64,
    /// Live feed reconnection policy.
    pub feed: FeedConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_url: None,
            request_timeout_secs: 30,
            setup_path: "/setup.json".to_string(),
            epoch_retry_ms: 1000,
            feed: FeedConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn epoch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.epoch_retry_ms)
    }

    /// Load defaults, then `file` (if it exists), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(file, Self::environment())
    }

    /// Like [`ClientConfig::load`] with an explicit environment source.
    pub fn load_with_env(file: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let built = builder.add_source(env).build()?;
        Ok(built.try_deserialize()?)
    }

    /// The `PARLEY__*` environment source.
    pub fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }
}
