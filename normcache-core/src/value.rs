//! Record value domain.
//!
//! A [`Value`] is what a record field holds: scalars, ordered lists,
//! embedded objects, references to other records, or an error sentinel that
//! stands in for data the server failed to produce.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::identity::CacheKey;

/// Ordered string-keyed object.
pub type Object = BTreeMap<String, Value>;

/// Variable bindings for one operation.
pub type Variables = BTreeMap<String, Value>;

/// One step of a response path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathElement {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(idx) => write!(f, "{}", idx),
        }
    }
}

impl From<&str> for PathElement {
    fn from(name: &str) -> Self {
        Self::Field(name.to_string())
    }
}

impl From<usize> for PathElement {
    fn from(idx: usize) -> Self {
        Self::Index(idx)
    }
}

/// Response path, root first.
pub type Path = Vec<PathElement>;

/// Render a path as `a.b.0.c`.
pub fn format_path(path: &[PathElement]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Error sentinel stored in place of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub message: String,
    pub path: Path,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>, path: Path) -> Self {
        Self {
            message: message.into(),
            path,
        }
    }
}

/// A record field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Object(Object),
    Reference(CacheKey),
    Error(ErrorValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            Self::Reference(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Stringified scalar, used for key values and arguments.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Double(d) => Some(d.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Visit every reference, including ones nested inside lists and objects.
    pub fn for_each_reference<F: FnMut(&CacheKey)>(&self, f: &mut F) {
        match self {
            Self::Reference(key) => f(key),
            Self::List(items) => items.iter().for_each(|item| item.for_each_reference(f)),
            Self::Object(obj) => obj.values().for_each(|v| v.for_each_reference(f)),
            _ => {}
        }
    }

    /// All references reachable inside this value.
    pub fn references(&self) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        self.for_each_reference(&mut |key| keys.push(key.clone()));
        keys
    }

    /// Returns true if any nested reference points into `keys`.
    pub fn references_any(&self, keys: &HashSet<CacheKey>) -> bool {
        match self {
            Self::Reference(key) => keys.contains(key),
            Self::List(items) => items.iter().any(|item| item.references_any(keys)),
            Self::Object(obj) => obj.values().any(|v| v.references_any(keys)),
            _ => false,
        }
    }

    /// Equality for change detection: doubles compare by bit pattern, so a
    /// NaN equals itself and `0.0` differs from `-0.0`.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
            }
            _ => self == other,
        }
    }

    /// JSON rendering. References render as `{"__ref": key}` and errors as
    /// `{"__error": message}`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Boolean(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Double(d) => serde_json::Number::from_f64(*d)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Object(obj) => Json::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Reference(key) => {
                let mut obj = serde_json::Map::new();
                obj.insert("__ref".to_string(), Json::String(key.to_string()));
                Json::Object(obj)
            }
            Self::Error(err) => {
                let mut obj = serde_json::Map::new();
                obj.insert("__error".to_string(), Json::String(err.message.clone()));
                Json::Object(obj)
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Boolean(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            Json::Object(obj) => {
                Self::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<CacheKey> for Value {
    fn from(key: CacheKey) -> Self {
        Self::Reference(key)
    }
}
