//! Cache and remote source configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning for the cache, the sync engine and the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `metadata.db`.
    pub cache_dir: PathBuf,
    /// Minutes a cached label stays live.
    pub label_ttl_minutes: u64,
    /// Language used when resolving labels.
    pub language: String,
    /// Rows per write transaction during population.
    pub write_batch_size: usize,
    /// Label ids per remote label request batch.
    pub label_batch_size: usize,
    /// Concurrent public entity schema requests.
    pub schema_concurrency: usize,
    /// Finished sessions kept in history.
    pub history_capacity: usize,
    /// Seconds between maintenance sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".metacache"),
            label_ttl_minutes: 60,
            language: "en-US".to_string(),
            write_batch_size: 500,
            label_batch_size: 50,
            schema_concurrency: 4,
            history_capacity: 20,
            sweep_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        for (name, value) in [
            ("write_batch_size", self.write_batch_size),
            ("label_batch_size", self.label_batch_size),
            ("schema_concurrency", self.schema_concurrency),
            ("history_capacity", self.history_capacity),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.language.trim().is_empty() {
            return Err(SyncError::Config("language must not be empty".into()));
        }
        Ok(())
    }

    pub fn label_ttl(&self) -> Duration {
        Duration::from_secs(self.label_ttl_minutes.saturating_mul(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Connection settings for [`HttpMetadataSource`](crate::source::http::HttpMetadataSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// Environment root, e.g. `https://contoso.operations.dynamics.com`.
    pub base_url: String,
    /// Bearer token, already acquired by the caller.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}
