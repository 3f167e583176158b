//! Flat, normalized records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::identity::{CacheKey, ChangedKeys};
use crate::value::{Object, Value};

/// Metadata key holding the unix time (seconds) a field was received.
pub const RECEIVED_DATE: &str = "received-date";
/// Metadata key holding a server-provided absolute expiry (unix seconds).
pub const EXPIRATION_DATE: &str = "expiration-date";

/// Field values of one record, keyed by field key.
pub type Fields = Object;

/// Arbitrary per-field metadata.
pub type FieldMetadata = BTreeMap<String, Value>;

/// One normalized object.
///
/// A field key missing from `fields` means "not fetched"; an explicit
/// `Value::Null` means the server returned null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: CacheKey,
    pub fields: Fields,
    pub metadata: BTreeMap<String, FieldMetadata>,
    pub mutation_id: Option<Uuid>,
}

impl Record {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            fields: Fields::new(),
            metadata: BTreeMap::new(),
            mutation_id: None,
        }
    }

    pub fn with_fields(key: CacheKey, fields: Fields) -> Self {
        Self {
            key,
            fields,
            metadata: BTreeMap::new(),
            mutation_id: None,
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, field_key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field_key.into(), value.into());
        self
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(
        mut self,
        field_key: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.metadata
            .entry(field_key.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn get(&self, field_key: &str) -> Option<&Value> {
        self.fields.get(field_key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// The `__typename` field, when it was selected.
    pub fn typename(&self) -> Option<&str> {
        self.fields.get("__typename").and_then(Value::as_str)
    }

    /// Best known type name: `__typename`, then the root type, then the key prefix.
    pub fn type_name_hint(&self) -> Option<&str> {
        self.typename()
            .or_else(|| self.key.root_type_name())
            .or_else(|| self.key.type_name())
    }

    /// Fully-qualified names of every field.
    pub fn field_keys(&self) -> ChangedKeys {
        self.fields.keys().map(|f| self.key.qualify(f)).collect()
    }

    /// Every record key referenced from any field.
    pub fn references(&self) -> HashSet<CacheKey> {
        let mut keys = HashSet::new();
        for value in self.fields.values() {
            value.for_each_reference(&mut |key| {
                keys.insert(key.clone());
            });
        }
        keys
    }

    pub fn received_date(&self, field_key: &str) -> Option<i64> {
        self.metadata_value(field_key, RECEIVED_DATE)
            .and_then(Value::as_i64)
    }

    pub fn expiration_date(&self, field_key: &str) -> Option<i64> {
        self.metadata_value(field_key, EXPIRATION_DATE)
            .and_then(Value::as_i64)
    }

    pub fn metadata_value(&self, field_key: &str, name: &str) -> Option<&Value> {
        self.metadata.get(field_key).and_then(|m| m.get(name))
    }

    /// Union another record for the same key into this one.
    ///
    /// Embedded objects present on both sides are unioned recursively;
    /// everything else is replaced by `other`. Metadata is unioned per field.
    pub fn union_with(&mut self, other: Record) {
        for (field_key, value) in other.fields {
            match self.fields.get_mut(&field_key) {
                Some(existing) => union_values(existing, value),
                None => {
                    self.fields.insert(field_key, value);
                }
            }
        }
        for (field_key, meta) in other.metadata {
            self.metadata.entry(field_key).or_default().extend(meta);
        }
        if other.mutation_id.is_some() {
            self.mutation_id = other.mutation_id;
        }
    }

    /// Shallow overlay: every field of `patch` replaces the same field here.
    pub fn overlay(&self, patch: &Record) -> Record {
        let mut merged = self.clone();
        for (field_key, value) in &patch.fields {
            merged.fields.insert(field_key.clone(), value.clone());
        }
        for (field_key, meta) in &patch.metadata {
            merged
                .metadata
                .entry(field_key.clone())
                .or_default()
                .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.mutation_id = patch.mutation_id.or(self.mutation_id);
        merged
    }

    /// Remove the given fields, returning the qualified names actually removed.
    pub fn strip_fields<'a, I>(&mut self, field_keys: I) -> ChangedKeys
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut removed = ChangedKeys::new();
        for field_key in field_keys {
            if self.fields.remove(field_key).is_some() {
                removed.insert(self.key.qualify(field_key));
            }
            self.metadata.remove(field_key);
        }
        removed
    }
}

fn union_values(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(next)) => {
            for (name, value) in next {
                match current.get_mut(&name) {
                    Some(slot) => union_values(slot, value),
                    None => {
                        current.insert(name, value);
                    }
                }
            }
        }
        (slot, next) => *slot = next,
    }
}

/// Qualified field names that differ between two versions of a record.
///
/// Added, removed and changed fields all count. Either side may be absent.
pub fn changed_fields(before: Option<&Record>, after: Option<&Record>) -> ChangedKeys {
    match (before, after) {
        (None, None) => ChangedKeys::new(),
        (Some(before), None) => before.field_keys(),
        (None, Some(after)) => after.field_keys(),
        (Some(before), Some(after)) => {
            let mut changed = ChangedKeys::new();
            for (field_key, value) in &after.fields {
                if !before.fields.get(field_key).is_some_and(|v| v.same_as(value)) {
                    changed.insert(after.key.qualify(field_key));
                }
            }
            for field_key in before.fields.keys() {
                if !after.fields.contains_key(field_key) {
                    changed.insert(before.key.qualify(field_key));
                }
            }
            changed
        }
    }
}
