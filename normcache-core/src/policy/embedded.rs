//! Fields whose object values are inlined into the parent record.

use std::collections::{HashMap, HashSet};

pub trait EmbeddedFieldsProvider: Send + Sync {
    fn embedded_fields(&self, parent_type: &str) -> HashSet<String>;

    fn is_embedded(&self, parent_type: &str, field_name: &str) -> bool {
        self.embedded_fields(parent_type).contains(field_name)
    }
}

/// Nothing is embedded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEmbeddedFieldsProvider;

impl EmbeddedFieldsProvider for DefaultEmbeddedFieldsProvider {
    fn embedded_fields(&self, _parent_type: &str) -> HashSet<String> {
        HashSet::new()
    }

    fn is_embedded(&self, _parent_type: &str, _field_name: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypePolicyEmbeddedFieldsProvider {
    fields: HashMap<String, HashSet<String>>,
}

impl TypePolicyEmbeddedFieldsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type<I, S>(mut self, parent_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .entry(parent_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }
}

impl EmbeddedFieldsProvider for TypePolicyEmbeddedFieldsProvider {
    fn embedded_fields(&self, parent_type: &str) -> HashSet<String> {
        self.fields.get(parent_type).cloned().unwrap_or_default()
    }

    fn is_embedded(&self, parent_type: &str, field_name: &str) -> bool {
        self.fields
            .get(parent_type)
            .map(|f| f.contains(field_name))
            .unwrap_or(false)
    }
}

/// Embeds connection fields into their owner, and `edges`/`pageInfo` into
/// the connection, so a paginated list lives in one record slot.
#[derive(Debug, Clone, Default)]
pub struct ConnectionEmbeddedFieldsProvider {
    connection_fields: HashMap<String, HashSet<String>>,
    connection_types: HashSet<String>,
}

impl ConnectionEmbeddedFieldsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, parent_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.connection_fields
            .entry(parent_type.into())
            .or_default()
            .insert(field.into());
        self
    }

    pub fn with_connection_type(mut self, typename: impl Into<String>) -> Self {
        self.connection_types.insert(typename.into());
        self
    }
}

impl EmbeddedFieldsProvider for ConnectionEmbeddedFieldsProvider {
    fn embedded_fields(&self, parent_type: &str) -> HashSet<String> {
        let mut fields = self
            .connection_fields
            .get(parent_type)
            .cloned()
            .unwrap_or_default();
        if self.connection_types.contains(parent_type) {
            fields.insert("edges".to_string());
            fields.insert("pageInfo".to_string());
        }
        fields
    }
}
