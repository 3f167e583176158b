//! Store configuration

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult, ConfigError};
use crate::identity::CacheKey;

const DEFAULT_MAX_AGE_SECS: u64 = 3600;
const DEFAULT_MAX_STALE_SECS: u64 = 0;
const DEFAULT_CHANGE_BUFFER_CAPACITY: usize = 64;
const DEFAULT_MEMORY_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_TRIM_FACTOR: f64 = 0.1;

/// How the batched reader handles misses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// The first miss aborts the read.
    #[default]
    Throw,
    /// Misses become Error values at their path.
    Partial,
}

impl std::str::FromStr for ReadMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "throw" => Ok(Self::Throw),
            "partial" => Ok(Self::Partial),
            other => Err(ConfigError::InvalidValue {
                field: "read_mode".to_string(),
                value: other.to_string(),
                reason: "expected 'throw' or 'partial'".to_string(),
            }),
        }
    }
}

/// Configuration for a normalized store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Max-age for fields without a more specific policy.
    pub default_max_age_secs: u64,
    /// Extra staleness allowance applied on top of max-age.
    pub max_stale_secs: u64,
    pub read_mode: ReadMode,
    pub errors_replace_cached_values: bool,
    /// Per-subscriber buffer of the change bus.
    pub change_buffer_capacity: usize,
    /// Byte budget for in-memory storage trimming.
    pub memory_max_bytes: u64,
    /// Fraction below `memory_max_bytes` to trim down to.
    pub trim_factor: f64,
    /// GC roots.
    pub root_keys: Vec<CacheKey>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_max_age_secs: DEFAULT_MAX_AGE_SECS,
            max_stale_secs: DEFAULT_MAX_STALE_SECS,
            read_mode: ReadMode::Throw,
            errors_replace_cached_values: false,
            change_buffer_capacity: DEFAULT_CHANGE_BUFFER_CAPACITY,
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            trim_factor: DEFAULT_TRIM_FACTOR,
            root_keys: CacheKey::roots(),
        }
    }
}

impl StoreConfig {
    /// Create a StoreConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `NORMCACHE_DEFAULT_MAX_AGE_SECS` (default: 3600)
    /// - `NORMCACHE_MAX_STALE_SECS` (default: 0)
    /// - `NORMCACHE_READ_MODE`: `throw` or `partial` (default: throw)
    /// - `NORMCACHE_ERRORS_REPLACE_CACHED_VALUES` (default: false)
    /// - `NORMCACHE_CHANGE_BUFFER_CAPACITY` (default: 64)
    /// - `NORMCACHE_MEMORY_MAX_BYTES` (default: 10 MiB)
    /// - `NORMCACHE_TRIM_FACTOR` (default: 0.1)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let default_max_age_secs = std::env::var("NORMCACHE_DEFAULT_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_AGE_SECS);

        let max_stale_secs = std::env::var("NORMCACHE_MAX_STALE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_STALE_SECS);

        let read_mode = std::env::var("NORMCACHE_READ_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let errors_replace_cached_values =
            std::env::var("NORMCACHE_ERRORS_REPLACE_CACHED_VALUES")
                .ok()
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        let change_buffer_capacity = std::env::var("NORMCACHE_CHANGE_BUFFER_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHANGE_BUFFER_CAPACITY);

        let memory_max_bytes = std::env::var("NORMCACHE_MEMORY_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MEMORY_MAX_BYTES);

        let trim_factor = std::env::var("NORMCACHE_TRIM_FACTOR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TRIM_FACTOR);

        Self {
            default_max_age_secs,
            max_stale_secs,
            read_mode,
            errors_replace_cached_values,
            change_buffer_capacity,
            memory_max_bytes,
            trim_factor,
            root_keys: CacheKey::roots(),
        }
    }

    pub fn with_default_max_age_secs(mut self, secs: u64) -> Self {
        self.default_max_age_secs = secs;
        self
    }

    pub fn with_max_stale_secs(mut self, secs: u64) -> Self {
        self.max_stale_secs = secs;
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn with_errors_replace_cached_values(mut self, enabled: bool) -> Self {
        self.errors_replace_cached_values = enabled;
        self
    }

    pub fn with_change_buffer_capacity(mut self, capacity: usize) -> Self {
        self.change_buffer_capacity = capacity;
        self
    }

    pub fn with_memory_max_bytes(mut self, bytes: u64) -> Self {
        self.memory_max_bytes = bytes;
        self
    }

    pub fn with_trim_factor(mut self, factor: f64) -> Self {
        self.trim_factor = factor;
        self
    }

    pub fn with_root_keys(mut self, keys: Vec<CacheKey>) -> Self {
        self.root_keys = keys;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - change_buffer_capacity > 0
    /// - trim_factor in [0.0, 1.0)
    /// - root_keys is not empty
    pub fn validate(&self) -> CacheResult<()> {
        if self.change_buffer_capacity == 0 {
            return Err(CacheError::Config(ConfigError::InvalidValue {
                field: "change_buffer_capacity".to_string(),
                value: self.change_buffer_capacity.to_string(),
                reason: "change_buffer_capacity must be greater than 0".to_string(),
            }));
        }

        if !(0.0..1.0).contains(&self.trim_factor) {
            return Err(CacheError::Config(ConfigError::InvalidValue {
                field: "trim_factor".to_string(),
                value: self.trim_factor.to_string(),
                reason: "trim_factor must be in [0.0, 1.0)".to_string(),
            }));
        }

        if self.root_keys.is_empty() {
            return Err(CacheError::Config(ConfigError::InvalidValue {
                field: "root_keys".to_string(),
                value: "[]".to_string(),
                reason: "at least one root key is required".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.read_mode, ReadMode::Throw);
        assert_eq!(config.root_keys.len(), 3);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = StoreConfig::default().with_change_buffer_capacity(0);
        match config.validate() {
            Err(CacheError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "change_buffer_capacity");
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_trim_factor_range() {
        assert!(StoreConfig::default().with_trim_factor(0.0).validate().is_ok());
        assert!(StoreConfig::default().with_trim_factor(1.0).validate().is_err());
        assert!(StoreConfig::default().with_trim_factor(-0.1).validate().is_err());
    }

    #[test]
    fn test_empty_roots_rejected() {
        assert!(StoreConfig::default()
            .with_root_keys(Vec::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_read_mode_from_str() {
        assert_eq!("Partial".parse::<ReadMode>(), Ok(ReadMode::Partial));
        assert_eq!("throw".parse::<ReadMode>(), Ok(ReadMode::Throw));
        assert!("lenient".parse::<ReadMode>().is_err());
    }

    #[test]
    fn test_from_env_defaults() {
        let config = StoreConfig::from_env();
        assert!(config.validate().is_ok());
    }
}
