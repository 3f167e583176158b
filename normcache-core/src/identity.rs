//! Identity types for normalized objects and field slots.
//!
//! A [`CacheKey`] names one normalized object. Declared keys have the form
//! `Type:value1+value2`; values are escaped so that `+` and `\` inside a
//! key value never split it. Objects without a stable identity get a key
//! derived from their path below the nearest keyed ancestor.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Key of the query root record.
pub const QUERY_ROOT: &str = "QUERY_ROOT";
/// Key of the mutation root record.
pub const MUTATION_ROOT: &str = "MUTATION_ROOT";
/// Key of the subscription root record.
pub const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";

const TYPE_SEPARATOR: char = ':';
const VALUE_SEPARATOR: char = '+';
const ESCAPE: char = '\\';

/// Storage slot name of one field: its name plus canonical arguments.
pub type FieldKey = String;

/// Fully-qualified `key.field` names, used for change notification.
pub type ChangedKeys = HashSet<String>;

/// Opaque identity string for a normalized object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-formed key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a declared key from a type name and one or more key values.
    pub fn declared<I, S>(typename: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = String::with_capacity(typename.len() + 16);
        key.push_str(typename);
        key.push(TYPE_SEPARATOR);
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                key.push(VALUE_SEPARATOR);
            }
            for c in value.as_ref().chars() {
                if c == VALUE_SEPARATOR || c == ESCAPE {
                    key.push(ESCAPE);
                }
                key.push(c);
            }
        }
        Self(key)
    }

    pub fn query_root() -> Self {
        Self(QUERY_ROOT.to_string())
    }

    pub fn mutation_root() -> Self {
        Self(MUTATION_ROOT.to_string())
    }

    pub fn subscription_root() -> Self {
        Self(SUBSCRIPTION_ROOT.to_string())
    }

    /// All three root keys.
    pub fn roots() -> Vec<CacheKey> {
        vec![
            Self::query_root(),
            Self::mutation_root(),
            Self::subscription_root(),
        ]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_root(&self) -> bool {
        matches!(self.0.as_str(), QUERY_ROOT | MUTATION_ROOT | SUBSCRIPTION_ROOT)
    }

    /// Type name of the root operation this key names, if it is a root.
    pub fn root_type_name(&self) -> Option<&'static str> {
        match self.0.as_str() {
            QUERY_ROOT => Some("Query"),
            MUTATION_ROOT => Some("Mutation"),
            SUBSCRIPTION_ROOT => Some("Subscription"),
            _ => None,
        }
    }

    /// Type name of a declared key (`User` for `User:1`).
    ///
    /// Path-derived keys have no type prefix and return `None`, even when
    /// their serialized arguments contain a colon.
    pub fn type_name(&self) -> Option<&str> {
        let (prefix, _) = self.0.split_once(TYPE_SEPARATOR)?;
        let mut chars = prefix.chars();
        let first = chars.next()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Some(prefix)
        } else {
            None
        }
    }

    /// Unescaped key values of a declared key.
    pub fn key_values(&self) -> Vec<String> {
        let Some(_) = self.type_name() else {
            return Vec::new();
        };
        let raw = match self.0.split_once(TYPE_SEPARATOR) {
            Some((_, raw)) => raw,
            None => return Vec::new(),
        };

        let mut values = vec![String::new()];
        let mut escaped = false;
        for c in raw.chars() {
            if escaped {
                if let Some(last) = values.last_mut() {
                    last.push(c);
                }
                escaped = false;
            } else if c == ESCAPE {
                escaped = true;
            } else if c == VALUE_SEPARATOR {
                values.push(String::new());
            } else if let Some(last) = values.last_mut() {
                last.push(c);
            }
        }
        values
    }

    /// Path-derived key for a field below this record.
    ///
    /// Children of the query root are keyed by the field key alone.
    pub fn child(&self, field_key: &str) -> CacheKey {
        if self.0 == QUERY_ROOT {
            Self(field_key.to_string())
        } else {
            Self(format!("{}.{}", self.0, field_key))
        }
    }

    /// Path-derived key for a list element.
    pub fn indexed(&self, index: usize) -> CacheKey {
        Self(format!("{}.{}", self.0, index))
    }

    /// Fully-qualified name of one field of this record.
    pub fn qualify(&self, field_key: &str) -> String {
        format!("{}.{}", self.0, field_key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Field name part of a field key (`user` for `user({"id":"1"})`).
pub fn field_name_of(field_key: &str) -> &str {
    match field_key.find('(') {
        Some(idx) => &field_key[..idx],
        None => field_key,
    }
}
