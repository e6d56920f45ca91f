//! Pipeline configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable that turns on per-fetch timing logs.
pub const FETCH_TIMING_ENV: &str = "IMAGEFETCH_FETCH_TIMING";

/// Check if per-fetch timing instrumentation is enabled via env var.
pub fn fetch_timing_enabled() -> bool {
    std::env::var(FETCH_TIMING_ENV).is_ok_and(|v| v == "1" || v == "true")
}

/// Configuration shared by the coordinator and the prefetch scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cost limit of the memory cache in bytes of decoded pixels.
    pub memory_cache_bytes: u64,
    /// Maximum number of prefetch fetches running at once.
    pub max_concurrent_prefetch: usize,
    /// Threads in the dedicated decode pool.
    pub decode_threads: usize,
    /// Log transport/decode timings for every fetch.
    pub fetch_timing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_cache_bytes: 256_000_000, // 256 MB
            max_concurrent_prefetch: 2,
            decode_threads: 2,
            fetch_timing: false,
        }
    }
}

impl PipelineConfig {
    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if fetch_timing_enabled() {
            self.fetch_timing = true;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_cache_bytes == 0 {
            return Err(ConfigError::Invalid(
                "memory_cache_bytes must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_prefetch == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_prefetch must be at least 1".into(),
            ));
        }
        if self.decode_threads == 0 {
            return Err(ConfigError::Invalid(
                "decode_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
