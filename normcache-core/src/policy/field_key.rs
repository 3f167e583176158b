//! Field storage slot naming.

use std::collections::{HashMap, HashSet};

use crate::identity::FieldKey;
use crate::selection::CompiledField;
use crate::value::{Value, Variables};

const PAGINATION_ARGUMENTS: [&str; 4] = ["first", "last", "before", "after"];

pub struct FieldKeyContext<'a> {
    pub parent_type: &'a str,
    pub field: &'a CompiledField,
    pub variables: &'a Variables,
}

/// Names the storage slot of a field.
///
/// Distinct argument sets must produce distinct keys, and the same
/// arguments must always produce the same key.
pub trait FieldKeyGenerator: Send + Sync {
    fn field_key(&self, context: &FieldKeyContext<'_>) -> FieldKey;
}

/// `name` or `name({"arg":value,...})` with arguments in declaration order.
pub fn field_key_with_arguments<'a, I>(name: &str, arguments: I) -> FieldKey
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut rendered = Vec::new();
    for (arg, value) in arguments {
        rendered.push(format!(
            "{}:{}",
            serde_json::Value::String(arg.to_string()),
            value.to_json()
        ));
    }
    if rendered.is_empty() {
        name.to_string()
    } else {
        format!("{}({{{}}})", name, rendered.join(","))
    }
}

/// Serializes every bound argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFieldKeyGenerator;

impl FieldKeyGenerator for DefaultFieldKeyGenerator {
    fn field_key(&self, context: &FieldKeyContext<'_>) -> FieldKey {
        let args = context.field.resolved_arguments(context.variables);
        field_key_with_arguments(&context.field.name, args.iter().map(|(k, v)| (*k, v)))
    }
}

/// Drops pagination arguments on connection fields so every page of a
/// connection shares one slot.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFieldKeyGenerator {
    connection_fields: HashMap<String, HashSet<String>>,
}

impl ConnectionFieldKeyGenerator {
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

    fn is_connection_field(&self, parent_type: &str, field: &str) -> bool {
        self.connection_fields
            .get(parent_type)
            .map(|fields| fields.contains(field))
            .unwrap_or(false)
    }
}

impl FieldKeyGenerator for ConnectionFieldKeyGenerator {
    fn field_key(&self, context: &FieldKeyContext<'_>) -> FieldKey {
        let field = context.field;
        if !self.is_connection_field(context.parent_type, &field.name) {
            return DefaultFieldKeyGenerator.field_key(context);
        }
        let kept: Vec<(&str, Value)> = field
            .arguments
            .iter()
            .filter(|arg| !arg.is_pagination && !PAGINATION_ARGUMENTS.contains(&arg.name.as_str()))
            .filter_map(|arg| arg.resolve(context.variables).map(|v| (arg.name.as_str(), v)))
            .collect();
        field_key_with_arguments(&field.name, kept.iter().map(|(k, v)| (*k, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{Argument, FieldType};

    #[test]
    fn test_default_without_arguments() {
        let field = CompiledField::builder("name", FieldType::scalar("String")).build();
        let vars = Variables::new();
        let key = DefaultFieldKeyGenerator.field_key(&FieldKeyContext {
            parent_type: "User",
            field: &field,
            variables: &vars,
        });
        assert_eq!(key, "name");
    }

    #[test]
    fn test_default_serializes_in_declaration_order() {
        let field = CompiledField::builder("search", FieldType::object("Result"))
            .argument(Argument::literal("term", "rust"))
            .argument(Argument::variable("limit", "n"))
            .argument(Argument::variable("cursor", "unbound"))
            .build();
        let mut vars = Variables::new();
        vars.insert("n".to_string(), Value::Int(5));
        let key = DefaultFieldKeyGenerator.field_key(&FieldKeyContext {
            parent_type: "Query",
            field: &field,
            variables: &vars,
        });
        assert_eq!(key, r#"search({"term":"rust","limit":5})"#);
    }

    #[test]
    fn test_distinct_arguments_distinct_keys() {
        let field = CompiledField::builder("user", FieldType::object("User"))
            .argument(Argument::variable("id", "id"))
            .build();
        let mut a = Variables::new();
        a.insert("id".to_string(), Value::from("1"));
        let mut b = Variables::new();
        b.insert("id".to_string(), Value::Int(1));
        let gen = DefaultFieldKeyGenerator;
        let ka = gen.field_key(&FieldKeyContext {
            parent_type: "Query",
            field: &field,
            variables: &a,
        });
        let kb = gen.field_key(&FieldKeyContext {
            parent_type: "Query",
            field: &field,
            variables: &b,
        });
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_connection_drops_pagination_arguments() {
        let field = CompiledField::builder("users", FieldType::object("UserConnection"))
            .argument(Argument::literal("first", 10i64))
            .argument(Argument::literal("after", "c1"))
            .argument(Argument::literal("filter", "active"))
            .argument(Argument::literal("window", 3i64).pagination())
            .build();
        let vars = Variables::new();
        let gen = ConnectionFieldKeyGenerator::new().with_field("Query", "users");
        let key = gen.field_key(&FieldKeyContext {
            parent_type: "Query",
            field: &field,
            variables: &vars,
        });
        assert_eq!(key, r#"users({"filter":"active"})"#);

        let other = gen.field_key(&FieldKeyContext {
            parent_type: "User",
            field: &field,
            variables: &vars,
        });
        assert!(other.contains("first"));
    }
}
