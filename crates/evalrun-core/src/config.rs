use crate::engine::retry::RetryPolicy;
use crate::errors::ConfigError;
use crate::model::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Process-wide engine settings shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// System-wide ceiling on concurrently executing test cases per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Deliveries attempted for a queued job before it is dropped.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_max_concurrency() -> usize {
    16
}

fn default_concurrency() -> usize {
    4
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_max_deliveries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            max_concurrency: default_max_concurrency(),
            default_concurrency: default_concurrency(),
            acquire_timeout_secs: default_acquire_timeout(),
            retry: RetryPolicy::default(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `EVALRUN_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("EVALRUN_MAX_CONCURRENCY") {
            self.max_concurrency = v;
        }
        if let Some(v) = env_parse("EVALRUN_DEFAULT_CONCURRENCY") {
            self.default_concurrency = v;
        }
        if let Some(v) = env_parse("EVALRUN_ACQUIRE_TIMEOUT") {
            self.acquire_timeout_secs = v;
        }
        if let Some(v) = env_parse("EVALRUN_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Parallel execution at `default_concurrency`, for callers without a preference.
    pub fn default_execution(&self) -> ExecutionMode {
        ExecutionMode::Parallel {
            concurrency: self.default_concurrency,
        }
    }

    /// Requested concurrency clamped to `[1, max_concurrency]`.
    pub fn effective_concurrency(&self, requested: usize) -> usize {
        let c = requested.clamp(1, self.max_concurrency.max(1));
        if c != requested {
            tracing::warn!(
                requested,
                effective = c,
                ceiling = self.max_concurrency,
                "clamping requested concurrency"
            );
        }
        c
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_CONFIG_VERSION {
            return Err(ConfigError(format!(
                "unsupported config version {} (supported: {})",
                self.version, SUPPORTED_CONFIG_VERSION
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError("max_concurrency must be at least 1".into()));
        }
        if self.default_concurrency == 0 {
            return Err(ConfigError("default_concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn parse_config(raw: &str) -> Result<EngineConfig, ConfigError> {
    let cfg: EngineConfig = serde_yaml::from_str(raw)
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg = parse_config(&raw)?;
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}
