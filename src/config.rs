//! Process-level configuration: cache settings and batch defaults.
//!
//! Loaded from YAML, then adjusted by `DEALSCOPE_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `DEALSCOPE_CACHE_DIR` | `cache.cache_dir` |
//! | `DEALSCOPE_MEMORY_CAPACITY` | `cache.memory_capacity` |
//! | `DEALSCOPE_DISK_CAPACITY` | `cache.disk_capacity` |
//! | `DEALSCOPE_CONCURRENCY` | `batch.max_concurrency` |
//! | `DEALSCOPE_RATE_LIMIT` | `batch.rate_limit` |
//!
//! Durations are written as whole seconds.

use crate::cache::CacheConfig;
use crate::resilience::{RateLimiterConfig, MAX_WINDOW};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CACHE_DIR: &str = "DEALSCOPE_CACHE_DIR";
pub const ENV_MEMORY_CAPACITY: &str = "DEALSCOPE_MEMORY_CAPACITY";
pub const ENV_DISK_CAPACITY: &str = "DEALSCOPE_DISK_CAPACITY";
pub const ENV_CONCURRENCY: &str = "DEALSCOPE_CONCURRENCY";
pub const ENV_RATE_LIMIT: &str = "DEALSCOPE_RATE_LIMIT";

/// Defaults applied to batches created without explicit options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchDefaults {
    pub max_concurrency: usize,
    /// Analyzer calls started per second across a batch's workers. Zero disables limiting.
    pub rate_limit: f64,
    /// TTL for analyzer results written back to the cache.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            rate_limit: 2.0,
            cache_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl BatchDefaults {
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }
    pub fn with_rate_limit(mut self, rps: f64) -> Self {
        self.rate_limit = rps;
        self
    }
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_concurrency(self.max_concurrency)?;
        validate_rate_limit(self.rate_limit)
    }
}

pub(crate) fn validate_concurrency(n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::validation_with_context(
            "max_concurrency must be at least 1",
            ErrorContext::new().with_field_path("batch.max_concurrency"),
        ));
    }
    Ok(())
}

pub(crate) fn validate_rate_limit(rps: f64) -> Result<()> {
    if RateLimiterConfig::from_rps(rps).is_none() {
        return Err(Error::validation_with_context(
            format!(
                "rate_limit must be 0 or at least one start per {}s, got {}",
                MAX_WINDOW.as_secs(),
                rps
            ),
            ErrorContext::new()
                .with_field_path("batch.rate_limit")
                .with_details("use 0 to disable rate limiting"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DealscopeConfig {
    pub cache: CacheConfig,
    pub batch: BatchDefaults,
}

impl DealscopeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Load `path` (or defaults when `None`), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEALSCOPE_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.trim().is_empty()) {
            self.cache.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup(ENV_MEMORY_CAPACITY) {
            self.cache.memory_capacity = parse_env(ENV_MEMORY_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_DISK_CAPACITY) {
            self.cache.disk_capacity = parse_env(ENV_DISK_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY) {
            self.batch.max_concurrency = parse_env(ENV_CONCURRENCY, &v)?;
        }
        if let Some(v) = lookup(ENV_RATE_LIMIT) {
            self.batch.rate_limit = parse_env(ENV_RATE_LIMIT, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.batch.validate()
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        Error::configuration_with_context(
            format!("invalid value {:?} for {}: {}", raw, name, e),
            ErrorContext::new().with_field_path(name).with_source("environment"),
        )
    })
}

/// Serde adapter writing a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = DealscopeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.max_concurrency, 4);
        assert_eq!(config.cache.memory_capacity, 256);
        assert!(config.cache.cache_dir.is_none());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
cache:
  cache_dir: /var/cache/dealscope
  memory_capacity: 64
  default_ttl: 3600
batch:
  rate_limit: 0.5
"#;
        let config = DealscopeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache.memory_capacity, 64);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.disk_capacity, 4096);
        assert_eq!(
            config.cache.cache_dir.as_deref(),
            Some(Path::new("/var/cache/dealscope"))
        );
        assert_eq!(config.batch.rate_limit, 0.5);
        assert_eq!(config.batch.max_concurrency, 4);
    }

    #[test]
    fn test_yaml_validation_fails_fast() {
        let err = DealscopeConfig::from_yaml_str("batch:\n  max_concurrency: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
        assert!(DealscopeConfig::from_yaml_str("batch:\n  rate_limit: -1\n").is_err());
        assert!(DealscopeConfig::from_yaml_str("batch:\n  rate_limit: 1.0e-20\n").is_err());
        assert!(matches!(
            DealscopeConfig::from_yaml_str("cache: [1, 2"),
            Err(Error::Yaml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_CACHE_DIR, "/tmp/ds"),
            (ENV_MEMORY_CAPACITY, "32"),
            (ENV_CONCURRENCY, " 8 "),
            (ENV_RATE_LIMIT, "0"),
        ]
        .into_iter()
        .collect();
        let mut config = DealscopeConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache.cache_dir, Some(PathBuf::from("/tmp/ds")));
        assert_eq!(config.cache.memory_capacity, 32);
        assert_eq!(config.batch.max_concurrency, 8);
        assert_eq!(config.batch.rate_limit, 0.0);
        assert_eq!(config.cache.disk_capacity, 4096);
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = DealscopeConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_DISK_CAPACITY).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DISK_CAPACITY));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dealscope.yaml");
        std::fs::write(&path, "cache:\n  sweep_interval: 30\n").unwrap();
        let config = DealscopeConfig::from_file(&path).unwrap();
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(30));
        assert!(DealscopeConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
