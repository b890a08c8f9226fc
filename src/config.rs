//! Engine configuration loaded from TOML, with environment overrides.

use crate::location::normalize::AbbreviationTable;
use crate::location::providers::NOMINATIM_ENDPOINT;
use crate::location::rate_limit::RateLimitSettings;
use crate::location::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub normalizer: NormalizerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Nominatim,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    /// Per-call deadline for one provider round-trip.
    pub timeout_ms: u64,
    /// JSON gazetteer for the static provider.
    pub gazetteer: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Nominatim,
            endpoint: NOMINATIM_ENDPOINT.to_string(),
            api_key: None,
            user_agent: format!("GeocodeEngine/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: 5_000,
            gazetteer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 24 * 3600,
            capacity: 10_000,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    /// Nominatim's usage policy allows one request per second.
    pub refill_per_sec: f64,
    pub acquire_timeout_ms: u64,
    pub max_in_flight: Option<usize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_per_sec: 1.0,
            acquire_timeout_ms: 30_000,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Token -> replacement, e.g. `st = "street"`. Empty means no folding.
    pub abbreviations: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Load `.env`, then the TOML file (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = var("GEOCODE_ENDPOINT").filter(|v| !v.is_empty()) {
            self.provider.endpoint = endpoint;
        }
        if let Some(key) = var("GEOCODE_API_KEY").filter(|v| !v.is_empty()) {
            self.provider.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.provider.timeout_ms == 0 {
            return invalid("provider.timeout_ms must be positive");
        }
        if self.provider.kind == ProviderKind::Nominatim && self.provider.endpoint.trim().is_empty() {
            return invalid("provider.endpoint must be set");
        }
        if self.cache.ttl_secs == 0 || self.cache.ttl_secs > MAX_TTL_SECS {
            return invalid("cache.ttl_secs must be between 1 and 100 years");
        }
        if self.rate_limit.capacity == 0 {
            return invalid("rate_limit.capacity must be at least 1");
        }
        if !(self.rate_limit.refill_per_sec.is_finite() && self.rate_limit.refill_per_sec > 0.0) {
            return invalid("rate_limit.refill_per_sec must be positive");
        }
        if self.rate_limit.max_in_flight == Some(0) {
            return invalid("rate_limit.max_in_flight must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within 0.0..=1.0");
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider.timeout_ms)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache.ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            capacity: self.rate_limit.capacity,
            refill_per_sec: self.rate_limit.refill_per_sec,
            acquire_timeout: Duration::from_millis(self.rate_limit.acquire_timeout_ms),
            max_in_flight: self.rate_limit.max_in_flight,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn abbreviations(&self) -> AbbreviationTable {
        AbbreviationTable::new(&self.normalizer.abbreviations)
    }
}
