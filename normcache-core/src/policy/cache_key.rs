//! Object identity policies.

use std::collections::HashMap;

use crate::identity::CacheKey;
use crate::selection::CompiledField;
use crate::value::{Object, Value, Variables};

/// Context handed to a [`CacheKeyGenerator`].
pub struct CacheKeyGeneratorContext<'a> {
    pub field: &'a CompiledField,
    pub variables: &'a Variables,
}

/// Computes the identity of a response object.
///
/// `None` means the object has no stable identity and is keyed by its path.
pub trait CacheKeyGenerator: Send + Sync {
    fn cache_key_for_object(
        &self,
        obj: &Object,
        context: &CacheKeyGeneratorContext<'_>,
    ) -> Option<CacheKey>;
}

/// Runtime typename of an object, falling back to the field's declared type.
pub fn object_typename<'a>(obj: &'a Object, field: &'a CompiledField) -> &'a str {
    obj.get("__typename")
        .and_then(Value::as_str)
        .unwrap_or(&field.raw_type().name)
}

fn key_from_fields(typename: &str, obj: &Object, key_fields: &[String]) -> Option<CacheKey> {
    if key_fields.is_empty() {
        return None;
    }
    let mut values = Vec::with_capacity(key_fields.len());
    for name in key_fields {
        values.push(obj.get(name)?.to_key_string()?);
    }
    Some(CacheKey::declared(typename, values))
}

/// Per-type key fields, declared in configuration or on the schema type.
#[derive(Debug, Clone, Default)]
pub struct TypePolicyCacheKeyGenerator {
    key_fields: HashMap<String, Vec<String>>,
}

impl TypePolicyCacheKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type<I, S>(mut self, typename: impl Into<String>, key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields.insert(
            typename.into(),
            key_fields.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl CacheKeyGenerator for TypePolicyCacheKeyGenerator {
    fn cache_key_for_object(
        &self,
        obj: &Object,
        context: &CacheKeyGeneratorContext<'_>,
    ) -> Option<CacheKey> {
        let typename = object_typename(obj, context.field);
        let key_fields = match self.key_fields.get(typename) {
            Some(fields) => fields.as_slice(),
            None => context.field.raw_type().key_fields.as_slice(),
        };
        key_from_fields(typename, obj, key_fields)
    }
}

/// Identity from literal id field(s); the first missing field means no identity.
#[derive(Debug, Clone)]
pub struct IdCacheKeyGenerator {
    id_fields: Vec<String>,
}

impl IdCacheKeyGenerator {
    pub fn new<I, S>(id_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id_fields: id_fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for IdCacheKeyGenerator {
    fn default() -> Self {
        Self::new(["id"])
    }
}

impl CacheKeyGenerator for IdCacheKeyGenerator {
    fn cache_key_for_object(
        &self,
        obj: &Object,
        context: &CacheKeyGeneratorContext<'_>,
    ) -> Option<CacheKey> {
        key_from_fields(object_typename(obj, context.field), obj, &self.id_fields)
    }
}
