//! Runtime-wide configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlinthError, Result};

/// Configuration shared by every plugin created from one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Interval between epoch ticks, in milliseconds. This bounds how
    /// quickly a running guest observes a cancellation request.
    #[serde(default = "default_epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Timeout applied to calls that do not carry their own.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Upper bound on linear memory pages, applied when a manifest sets none.
    #[serde(default)]
    pub max_memory_pages: Option<u32>,

    /// Share compiled modules between plugins loaded from identical bytes.
    #[serde(default = "default_cache_modules")]
    pub cache_modules: bool,
}

fn default_epoch_tick_ms() -> u64 {
    10
}

fn default_cache_modules() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epoch_tick_ms: default_epoch_tick_ms(),
            default_timeout_ms: None,
            max_memory_pages: None,
            cache_modules: default_cache_modules(),
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PlinthError::Config(e.to_string()))?;
        if config.epoch_tick_ms == 0 {
            return Err(PlinthError::Config(
                "epoch_tick_ms must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    /// Sets the epoch tick interval.
    pub fn with_epoch_tick(mut self, tick: Duration) -> Self {
        self.epoch_tick_ms = (tick.as_millis() as u64).max(1);
        self
    }

    /// Sets the timeout for calls without their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the memory page limit.
    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = Some(pages);
        self
    }

    /// Enables or disables the compiled module cache.
    pub fn with_module_cache(mut self, enabled: bool) -> Self {
        self.cache_modules = enabled;
        self
    }

    /// Interval between epoch ticks, the cancellation checkpoint period.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }

    /// Timeout applied to calls that set none of their own.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
