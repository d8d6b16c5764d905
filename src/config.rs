use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

const DEFAULT_RENEW_FRACTION: f64 = 1.0 / 3.0;
const DEFAULT_ACQUIRE_BACKOFF_BASE_MS: u64 = 25;
const DEFAULT_ACQUIRE_BACKOFF_MAX_MS: u64 = 1_000;
const DEFAULT_STORE_MAX_ATTEMPTS: usize = 4;
const DEFAULT_STORE_BASE_DELAY_MS: u64 = 50;
const DEFAULT_STORE_MAX_DELAY_MS: u64 = 2_000;

/// Tuning for a [`LockCore`](crate::LockCore).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Identity written into every lease. A fresh ULID when unset.
    pub holder_id: Option<String>,

    /// Start a background renewer for every acquired handle.
    pub auto_renew: bool,

    /// Renewal cadence as a fraction of the lease duration.
    pub renew_fraction: f64,

    pub acquire_backoff_base_ms: u64,
    pub acquire_backoff_max_ms: u64,

    pub store_retry: StoreRetryConfig,
}

/// Bounded retry applied to every store round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreRetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            holder_id: None,
            auto_renew: true,
            renew_fraction: DEFAULT_RENEW_FRACTION,
            acquire_backoff_base_ms: DEFAULT_ACQUIRE_BACKOFF_BASE_MS,
            acquire_backoff_max_ms: DEFAULT_ACQUIRE_BACKOFF_MAX_MS,
            store_retry: StoreRetryConfig::default(),
        }
    }
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_STORE_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_STORE_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_STORE_MAX_DELAY_MS,
        }
    }
}

impl StoreRetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl LockConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: LockConfig = toml::from_str(contents)
            .map_err(|e| LockError::Config(format!("failed to parse lock config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "lock config not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            LockError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), "loaded lock config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(LockError::Config(format!(
                "renew_fraction must be within (0, 1), got {}",
                self.renew_fraction
            )));
        }
        if self.acquire_backoff_base_ms > self.acquire_backoff_max_ms {
            return Err(LockError::Config(
                "acquire_backoff_base_ms exceeds acquire_backoff_max_ms".to_string(),
            ));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(LockError::Config(
                "store_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store_retry.base_delay_ms > self.store_retry.max_delay_ms {
            return Err(LockError::Config(
                "store_retry.base_delay_ms exceeds store_retry.max_delay_ms".to_string(),
            ));
        }
        if matches!(&self.holder_id, Some(id) if id.is_empty()) {
            return Err(LockError::Config("holder_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    pub fn acquire_backoff_base(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_base_ms)
    }

    pub fn acquire_backoff_max(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_max_ms)
    }

    /// Interval between renewals for a lease of the given length.
    pub fn renew_interval(&self, lease_duration: Duration) -> Duration {
        lease_duration
            .mul_f64(self.renew_fraction)
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert!(config.auto_renew);
        assert_eq!(config.holder_id, None);
        assert_eq!(config.store_retry.max_attempts, DEFAULT_STORE_MAX_ATTEMPTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renew_interval_is_a_third_by_default() {
        let config = LockConfig::default();
        let interval = config.renew_interval(Duration::from_millis(900));
        assert!((interval.as_secs_f64() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_partial_config() {
        let config = LockConfig::from_toml_str(
            r#"
            holder_id = "worker-7"

            [store_retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.holder_id.as_deref(), Some("worker-7"));
        assert_eq!(config.store_retry.max_attempts, 2);
        assert_eq!(config.store_retry.base_delay_ms, DEFAULT_STORE_BASE_DELAY_MS);
        assert_eq!(config.acquire_backoff_max_ms, DEFAULT_ACQUIRE_BACKOFF_MAX_MS);
    }

    #[test]
    fn test_rejects_bad_renew_fraction() {
        let err = LockConfig::from_toml_str("renew_fraction = 1.5").unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = LockConfig::from_toml_str("[store_retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = LockConfig::from_toml_str("auto_renew = \"yes\"").unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = LockConfig::load(&temp_dir.path().join("lock.toml")).unwrap();
        assert_eq!(config, LockConfig::default());
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lock.toml");
        fs::write(&path, "auto_renew = false\nacquire_backoff_base_ms = 5").unwrap();

        let config = LockConfig::load(&path).unwrap();
        assert!(!config.auto_renew);
        assert_eq!(config.acquire_backoff_base_ms, 5);
    }
}
