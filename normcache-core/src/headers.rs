//! Cache headers passed alongside reads and writes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Skip persisting a write.
pub const DO_NOT_STORE: &str = "do-not-store";
/// Allow Error sentinels to overwrite good cached values.
pub const ERRORS_REPLACE_CACHED_VALUES: &str = "errors-replace-cached-values";
/// Extra staleness allowance in seconds.
pub const MAX_STALE: &str = "max-stale";
/// Unix seconds stamped into per-field metadata on write.
pub const RECEIVED_DATE: &str = "received-date";
/// Server-provided absolute expiry in unix seconds.
pub const EXPIRATION_DATE: &str = "expiration-date";
/// Remove every record a successful read loaded from the base storage.
pub const EVICT_AFTER_READ: &str = "evict-after-read";

/// Immutable string map of cache directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHeaders {
    entries: BTreeMap<String, String>,
}

impl CacheHeaders {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> CacheHeadersBuilder {
        CacheHeadersBuilder::default()
    }

    /// Builder seeded with these headers.
    pub fn to_builder(&self) -> CacheHeadersBuilder {
        CacheHeadersBuilder {
            entries: self.entries.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// True when the header is present with value `true`.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn do_not_store(&self) -> bool {
        self.flag(DO_NOT_STORE)
    }

    pub fn errors_replace_cached_values(&self) -> bool {
        self.flag(ERRORS_REPLACE_CACHED_VALUES)
    }

    pub fn evict_after_read(&self) -> bool {
        self.flag(EVICT_AFTER_READ)
    }

    pub fn max_stale_secs(&self) -> Option<i64> {
        self.int(MAX_STALE)
    }

    pub fn received_date(&self) -> Option<i64> {
        self.int(RECEIVED_DATE)
    }

    pub fn expiration_date(&self) -> Option<i64> {
        self.int(EXPIRATION_DATE)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct CacheHeadersBuilder {
    entries: BTreeMap<String, String>,
}

impl CacheHeadersBuilder {
    pub fn add(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.entries.insert(name.into(), value.to_string());
        self
    }

    pub fn flag(self, name: impl Into<String>) -> Self {
        self.add(name, "true")
    }

    pub fn build(self) -> CacheHeaders {
        CacheHeaders {
            entries: self.entries,
        }
    }
}
