//! Compiled selection trees.
//!
//! The engine never parses query text. It consumes an already-compiled tree
//! of [`Selection`]s: fields carrying their declared type and arguments, and
//! fragments carrying the set of concrete types they apply to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::identity::CacheKey;
use crate::value::{Value, Variables};

// ============================================================================
// TYPES
// ============================================================================

/// Kind of a named schema type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Scalar,
    Enum,
    Object,
    Interface,
    Union,
}

/// A named schema type, optionally with declared key fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedType {
    pub name: String,
    pub kind: TypeKind,
    pub key_fields: Vec<String>,
}

impl NamedType {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            key_fields: Vec::new(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object | TypeKind::Interface | TypeKind::Union
        )
    }
}

/// Declared type of a field, with list and non-null wrappers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Named(NamedType),
    List(Box<FieldType>),
    NonNull(Box<FieldType>),
}

impl FieldType {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::Named(NamedType::new(name, TypeKind::Scalar))
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::Named(NamedType::new(name, TypeKind::Object))
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::Named(NamedType::new(name, TypeKind::Interface))
    }

    /// Object type with schema-declared key fields.
    pub fn keyed_object<I, S>(name: impl Into<String>, key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut named = NamedType::new(name, TypeKind::Object);
        named.key_fields = key_fields.into_iter().map(Into::into).collect();
        Self::Named(named)
    }

    pub fn non_null(self) -> Self {
        Self::NonNull(Box::new(self))
    }

    pub fn list(self) -> Self {
        Self::List(Box::new(self))
    }

    /// The named type below every wrapper.
    pub fn raw_type(&self) -> &NamedType {
        match self {
            Self::Named(named) => named,
            Self::List(inner) | Self::NonNull(inner) => inner.raw_type(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.raw_type().is_composite()
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, Self::NonNull(_))
    }

    /// Strip one non-null wrapper, if present.
    pub fn nullable(&self) -> &FieldType {
        match self {
            Self::NonNull(inner) => inner,
            other => other,
        }
    }

    /// Element type when this (possibly non-null) type is a list.
    pub fn list_item(&self) -> Option<&FieldType> {
        match self.nullable() {
            Self::List(inner) => Some(inner),
            _ => None,
        }
    }
}

// ============================================================================
// ARGUMENTS AND CONDITIONS
// ============================================================================

/// Argument value as written in the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Literal(Value),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
    /// Part of the target object's identity.
    pub is_key: bool,
    /// Pagination cursor or window argument.
    pub is_pagination: bool,
}

impl Argument {
    pub fn literal(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: ArgValue::Literal(value.into()),
            is_key: false,
            is_pagination: false,
        }
    }

    pub fn variable(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ArgValue::Variable(variable.into()),
            is_key: false,
            is_pagination: false,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn pagination(mut self) -> Self {
        self.is_pagination = true;
        self
    }

    /// Bound value, or `None` when it names an unbound variable.
    pub fn resolve(&self, variables: &Variables) -> Option<Value> {
        match &self.value {
            ArgValue::Literal(value) => Some(value.clone()),
            ArgValue::Variable(name) => variables.get(name).cloned(),
        }
    }
}

/// `@include(if: $var)` or, when inverted, `@skip(if: $var)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub inverted: bool,
}

impl Condition {
    pub fn include(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            inverted: false,
        }
    }

    pub fn skip(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            inverted: true,
        }
    }

    /// Missing or non-boolean variables count as `false`.
    pub fn passes(&self, variables: &Variables) -> bool {
        let value = variables
            .get(&self.variable)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        value != self.inverted
    }
}

fn all_pass(conditions: &[Condition], variables: &Variables) -> bool {
    conditions.iter().all(|c| c.passes(variables))
}

// ============================================================================
// SELECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledField {
    pub name: String,
    pub alias: Option<String>,
    pub ty: FieldType,
    pub arguments: Vec<Argument>,
    pub conditions: Vec<Condition>,
    pub selections: Vec<Selection>,
}

impl CompiledField {
    pub fn builder(name: impl Into<String>, ty: FieldType) -> CompiledFieldBuilder {
        CompiledFieldBuilder {
            field: CompiledField {
                name: name.into(),
                alias: None,
                ty,
                arguments: Vec::new(),
                conditions: Vec::new(),
                selections: Vec::new(),
            },
        }
    }

    /// Name the field has in the response: its alias, else its name.
    pub fn response_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn raw_type(&self) -> &NamedType {
        self.ty.raw_type()
    }

    pub fn is_included(&self, variables: &Variables) -> bool {
        all_pass(&self.conditions, variables)
    }

    /// Bound arguments in declaration order; unbound variables are omitted.
    pub fn resolved_arguments(&self, variables: &Variables) -> Vec<(&str, Value)> {
        self.arguments
            .iter()
            .filter_map(|arg| arg.resolve(variables).map(|v| (arg.name.as_str(), v)))
            .collect()
    }

    pub fn argument_value(&self, name: &str, variables: &Variables) -> Option<Value> {
        self.arguments
            .iter()
            .find(|arg| arg.name == name)
            .and_then(|arg| arg.resolve(variables))
    }

    /// Values of the declared key arguments, in declaration order.
    pub fn key_argument_values(&self, variables: &Variables) -> Vec<Value> {
        self.arguments
            .iter()
            .filter(|arg| arg.is_key)
            .filter_map(|arg| arg.resolve(variables))
            .collect()
    }
}

pub struct CompiledFieldBuilder {
    field: CompiledField,
}

impl CompiledFieldBuilder {
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.field.alias = Some(alias.into());
        self
    }

    pub fn argument(mut self, argument: Argument) -> Self {
        self.field.arguments.push(argument);
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.field.conditions.push(condition);
        self
    }

    pub fn selection(mut self, selection: impl Into<Selection>) -> Self {
        self.field.selections.push(selection.into());
        self
    }

    pub fn selections<I>(mut self, selections: I) -> Self
    where
        I: IntoIterator<Item = Selection>,
    {
        self.field.selections.extend(selections);
        self
    }

    pub fn build(self) -> CompiledField {
        self.field
    }
}

/// Inline fragment or fragment spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFragment {
    pub type_condition: String,
    pub possible_types: Vec<String>,
    pub conditions: Vec<Condition>,
    pub selections: Vec<Selection>,
}

impl CompiledFragment {
    pub fn new<I, S>(type_condition: impl Into<String>, possible_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_condition: type_condition.into(),
            possible_types: possible_types.into_iter().map(Into::into).collect(),
            conditions: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_selection(mut self, selection: impl Into<Selection>) -> Self {
        self.selections.push(selection.into());
        self
    }

    /// Whether this fragment applies to an object of the given runtime type.
    ///
    /// Without a known typename the fragment applies only when its type
    /// condition is the parent type itself.
    pub fn applies_to(&self, typename: Option<&str>, parent_type: &str) -> bool {
        match typename {
            Some(typename) => self.possible_types.iter().any(|t| t == typename),
            None => self.type_condition == parent_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    Field(CompiledField),
    Fragment(CompiledFragment),
}

impl From<CompiledField> for Selection {
    fn from(field: CompiledField) -> Self {
        Self::Field(field)
    }
}

impl From<CompiledFragment> for Selection {
    fn from(fragment: CompiledFragment) -> Self {
        Self::Fragment(fragment)
    }
}

/// Flatten a selection set into the fields that apply to one object.
///
/// Fragments are expanded when they apply to `typename`, skipped and
/// excluded selections are dropped, and fields sharing a response name are
/// merged by concatenating their sub-selections. The first occurrence of a
/// response name decides its position.
pub fn collect_fields(
    selections: &[Selection],
    parent_type: &str,
    typename: Option<&str>,
    variables: &Variables,
) -> Vec<CompiledField> {
    let mut fields: Vec<CompiledField> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    collect_into(
        selections,
        parent_type,
        typename,
        variables,
        &mut fields,
        &mut positions,
    );
    fields
}

fn collect_into(
    selections: &[Selection],
    parent_type: &str,
    typename: Option<&str>,
    variables: &Variables,
    fields: &mut Vec<CompiledField>,
    positions: &mut HashMap<String, usize>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                if !field.is_included(variables) {
                    continue;
                }
                match positions.get(field.response_name()) {
                    Some(&idx) => fields[idx]
                        .selections
                        .extend(field.selections.iter().cloned()),
                    None => {
                        positions.insert(field.response_name().to_string(), fields.len());
                        fields.push(field.clone());
                    }
                }
            }
            Selection::Fragment(fragment) => {
                if !all_pass(&fragment.conditions, variables)
                    || !fragment.applies_to(typename, parent_type)
                {
                    continue;
                }
                collect_into(
                    &fragment.selections,
                    parent_type,
                    typename,
                    variables,
                    fields,
                    positions,
                );
            }
        }
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// A compiled operation: its root selections plus the root it reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OperationKind,
    pub selections: Vec<Selection>,
}

impl Operation {
    pub fn query(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Query,
            selections,
        }
    }

    pub fn mutation(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Mutation,
            selections,
        }
    }

    pub fn root_key(&self) -> CacheKey {
        match self.kind {
            OperationKind::Query => CacheKey::query_root(),
            OperationKind::Mutation => CacheKey::mutation_root(),
            OperationKind::Subscription => CacheKey::subscription_root(),
        }
    }

    pub fn root_type(&self) -> &'static str {
        match self.kind {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str) -> Selection {
        CompiledField::builder(name, FieldType::scalar("String"))
            .build()
            .into()
    }

    #[test]
    fn test_raw_type_unwraps_wrappers() {
        let ty = FieldType::object("User").non_null().list().non_null();
        assert_eq!(ty.raw_type().name, "User");
        assert!(ty.is_composite());
        assert!(ty.is_non_null());
        assert!(ty.list_item().is_some());
        assert!(FieldType::scalar("Int").list_item().is_none());
    }

    #[test]
    fn test_conditions() {
        let mut vars = Variables::new();
        vars.insert("flag".to_string(), Value::Boolean(true));

        assert!(Condition::include("flag").passes(&vars));
        assert!(!Condition::skip("flag").passes(&vars));
        assert!(!Condition::include("missing").passes(&vars));
        assert!(Condition::skip("missing").passes(&vars));
    }

    #[test]
    fn test_resolved_arguments_omit_unbound_variables() {
        let field = CompiledField::builder("user", FieldType::object("User"))
            .argument(Argument::variable("id", "userId").key())
            .argument(Argument::variable("locale", "locale"))
            .argument(Argument::literal("size", 10i64))
            .build();
        let mut vars = Variables::new();
        vars.insert("userId".to_string(), Value::from("42"));

        let args = field.resolved_arguments(&vars);
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], ("id", Value::from("42")));
        assert_eq!(args[1], ("size", Value::Int(10)));
        assert_eq!(field.key_argument_values(&vars), vec![Value::from("42")]);
    }

    #[test]
    fn test_collect_fields_merges_aliases_and_fragments() {
        let selections = vec![
            scalar("id"),
            CompiledField::builder("friend", FieldType::object("User"))
                .selection(scalar("name"))
                .build()
                .into(),
            CompiledFragment::new("User", ["User"])
                .with_selection(
                    CompiledField::builder("friend", FieldType::object("User"))
                        .selection(scalar("email"))
                        .build(),
                )
                .into(),
            CompiledFragment::new("Bot", ["Bot"])
                .with_selection(scalar("model"))
                .into(),
        ];

        let fields = collect_fields(&selections, "Node", Some("User"), &Variables::new());
        let names: Vec<_> = fields.iter().map(|f| f.response_name()).collect();
        assert_eq!(names, vec!["id", "friend"]);
        assert_eq!(fields[1].selections.len(), 2);
    }

    #[test]
    fn test_collect_fields_unknown_typename_uses_parent_type() {
        let selections = vec![
            CompiledFragment::new("User", ["User"])
                .with_selection(scalar("name"))
                .into(),
            CompiledFragment::new("Bot", ["Bot"])
                .with_selection(scalar("model"))
                .into(),
        ];
        let fields = collect_fields(&selections, "User", None, &Variables::new());
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "name");
    }

    #[test]
    fn test_collect_fields_drops_skipped() {
        let selections = vec![
            scalar("id"),
            CompiledField::builder("secret", FieldType::scalar("String"))
                .condition(Condition::include("showSecret"))
                .build()
                .into(),
        ];
        let fields = collect_fields(&selections, "User", Some("User"), &Variables::new());
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_operation_roots() {
        let op = Operation::mutation("CreateUser", vec![]);
        assert_eq!(op.root_key(), CacheKey::mutation_root());
        assert_eq!(op.root_type(), "Mutation");
    }
}
