//! Error types for normcache operations

use thiserror::Error;

/// Read-path misses.
///
/// A miss is not a storage failure: the backing store answered, but the
/// answer could not satisfy the selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MissError {
    #[error("Cache miss: {}", describe_miss(key, field.as_deref()))]
    CacheMiss { key: String, field: Option<String> },

    #[error("Stale cache miss: field {field} of {key} is {age_secs}s old, allowed {allowed_secs}s")]
    StaleMiss {
        key: String,
        field: String,
        age_secs: i64,
        allowed_secs: i64,
    },
}

fn describe_miss(key: &str, field: Option<&str>) -> String {
    match field {
        Some(field) => format!("no field {field} on record {key}"),
        None => format!("no record for {key}"),
    }
}

impl MissError {
    /// Miss for a whole record.
    pub fn record(key: impl Into<String>) -> Self {
        Self::CacheMiss {
            key: key.into(),
            field: None,
        }
    }

    /// Miss for one field slot of a record.
    pub fn field(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::CacheMiss {
            key: key.into(),
            field: Some(field.into()),
        }
    }

    /// Returns true if the value was present but too old.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleMiss { .. })
    }

    /// The record key the miss occurred on.
    pub fn key(&self) -> &str {
        match self {
            Self::CacheMiss { key, .. } | Self::StaleMiss { key, .. } => key,
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage backend failed: {reason}")]
    Backend { reason: String },

    #[error("Record codec failed: {reason}")]
    Codec { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all normcache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Miss: {0}")]
    Miss(#[from] MissError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Read cancelled")]
    Cancelled,
}

impl CacheError {
    /// Returns the miss if this error is one.
    pub fn as_miss(&self) -> Option<&MissError> {
        match self {
            Self::Miss(miss) => Some(miss),
            _ => None,
        }
    }
}

/// Result type alias for normcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
