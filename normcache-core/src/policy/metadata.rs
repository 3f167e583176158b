//! Per-field metadata generation.

use std::collections::HashSet;

use crate::record::FieldMetadata;
use crate::selection::CompiledField;
use crate::value::{Value, Variables};

pub const START_CURSOR: &str = "startCursor";
pub const END_CURSOR: &str = "endCursor";
pub const BEFORE: &str = "before";
pub const AFTER: &str = "after";

pub struct MetadataGeneratorContext<'a> {
    pub field: &'a CompiledField,
    pub variables: &'a Variables,
}

/// Produces metadata for a field's value, stored next to (not inside) it.
pub trait MetadataGenerator: Send + Sync {
    fn metadata_for_object(
        &self,
        value: &Value,
        context: &MetadataGeneratorContext<'_>,
    ) -> FieldMetadata;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyMetadataGenerator;

impl MetadataGenerator for EmptyMetadataGenerator {
    fn metadata_for_object(&self, _: &Value, _: &MetadataGeneratorContext<'_>) -> FieldMetadata {
        FieldMetadata::new()
    }
}

/// Records page cursors and the requesting window of connection fields.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadataGenerator {
    connection_types: HashSet<String>,
}

impl ConnectionMetadataGenerator {
    pub fn new<I, S>(connection_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connection_types: connection_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl MetadataGenerator for ConnectionMetadataGenerator {
    fn metadata_for_object(
        &self,
        value: &Value,
        context: &MetadataGeneratorContext<'_>,
    ) -> FieldMetadata {
        let mut metadata = FieldMetadata::new();
        if !self
            .connection_types
            .contains(&context.field.raw_type().name)
        {
            return metadata;
        }
        let Some(obj) = value.as_object() else {
            return metadata;
        };

        if let Some(page_info) = obj.get("pageInfo").and_then(Value::as_object) {
            for cursor in [START_CURSOR, END_CURSOR] {
                if let Some(v) = page_info.get(cursor).filter(|v| !v.is_null()) {
                    metadata.insert(cursor.to_string(), v.clone());
                }
            }
        }
        for arg in [BEFORE, AFTER] {
            if let Some(v) = context
                .field
                .argument_value(arg, context.variables)
                .filter(|v| !v.is_null())
            {
                metadata.insert(arg.to_string(), v);
            }
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{Argument, FieldType};
    use serde_json::json;

    #[test]
    fn test_connection_metadata() {
        let field = CompiledField::builder("users", FieldType::object("UserConnection"))
            .argument(Argument::variable("after", "cursor"))
            .build();
        let mut vars = Variables::new();
        vars.insert("cursor".to_string(), Value::from("c2"));
        let value = Value::from(json!({
            "pageInfo": {"startCursor": "c3", "endCursor": "c4", "hasNextPage": true}
        }));

        let generator = ConnectionMetadataGenerator::new(["UserConnection"]);
        let meta = generator.metadata_for_object(
            &value,
            &MetadataGeneratorContext {
                field: &field,
                variables: &vars,
            },
        );
        assert_eq!(meta.get(START_CURSOR), Some(&Value::from("c3")));
        assert_eq!(meta.get(END_CURSOR), Some(&Value::from("c4")));
        assert_eq!(meta.get(AFTER), Some(&Value::from("c2")));
        assert!(!meta.contains_key(BEFORE));
    }

    #[test]
    fn test_non_connection_field_has_no_metadata() {
        let field = CompiledField::builder("user", FieldType::object("User")).build();
        let vars = Variables::new();
        let generator = ConnectionMetadataGenerator::new(["UserConnection"]);
        let meta = generator.metadata_for_object(
            &Value::from(json!({"pageInfo": {"startCursor": "a"}})),
            &MetadataGeneratorContext {
                field: &field,
                variables: &vars,
            },
        );
        assert!(meta.is_empty());
    }
}
