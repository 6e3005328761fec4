//! Process-level configuration loading and representation.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use jobthrottle_core::key::DEFAULT_KEY_PREFIX;
use jobthrottle_core::{ConfigError, ConfigResult};

use crate::store::{CounterStore, InMemoryCounterStore, StoreResult};

pub const ENV_KEY_PREFIX: &str = "JOBTHROTTLE_KEY_PREFIX";
pub const ENV_BACKEND: &str = "JOBTHROTTLE_BACKEND";
pub const ENV_WORKERS: &str = "JOBTHROTTLE_WORKERS";
pub const ENV_REDIS_URL: &str = "REDIS_URL";

/// Which counter store the process coordinates through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Single process only.
    #[default]
    InMemory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Ok(Self::InMemory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::invalid_value(
                "backend",
                format!("unknown backend `{other}` (expected `memory` or `redis`)"),
            )),
        }
    }
}

/// Settings shared by every throttle in a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    /// Namespace for all store keys.
    pub key_prefix: String,
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Worker threads for the executor.
    pub workers: usize,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            backend: StoreBackend::InMemory,
            redis_url: "redis://localhost:6379".to_string(),
            workers: 4,
        }
    }
}

impl ThrottleSettings {
    /// Read settings from the process environment, falling back to defaults.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup` (variable name to value).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut settings = Self::default();

        if let Some(prefix) = lookup(ENV_KEY_PREFIX) {
            settings.key_prefix = prefix;
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            settings.backend = backend.parse()?;
        }
        if let Some(url) = lookup(ENV_REDIS_URL) {
            settings.redis_url = url;
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            settings.workers = workers
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid_value("workers", format!("`{workers}`: {e}")))?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::invalid_value("key_prefix", "must not be empty"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid_value("workers", "must be at least 1"));
        }
        Ok(())
    }

    /// Open the configured counter store.
    pub fn open_store(&self) -> StoreResult<Arc<dyn CounterStore>> {
        match self.backend {
            StoreBackend::InMemory => {
                info!("using in-memory counter store; throttles are not shared across processes");
                Ok(Arc::new(InMemoryCounterStore::new()))
            }
            StoreBackend::Redis => self.open_redis(),
        }
    }

    #[cfg(feature = "redis")]
    fn open_redis(&self) -> StoreResult<Arc<dyn CounterStore>> {
        info!(url = %self.redis_url, "using redis counter store");
        Ok(Arc::new(crate::store::RedisCounterStore::new(&self.redis_url)?))
    }

    #[cfg(not(feature = "redis"))]
    fn open_redis(&self) -> StoreResult<Arc<dyn CounterStore>> {
        Err(crate::store::StoreError::Unsupported(
            "redis backend requested but the `redis` feature is not enabled".to_string(),
        ))
    }
}
