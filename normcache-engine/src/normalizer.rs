//! Response normalization
//!
//! Walks a response tree under its selection tree and flattens every object
//! into a record. Objects with an identity become references to their own
//! record; objects without one are keyed by their path from the nearest
//! identified ancestor. Embedded fields stay inline in the parent record.

use std::collections::{BTreeMap, HashMap};

use normcache_core::policy::{
    CacheKeyGeneratorContext, FieldInfo, FieldKeyContext, MaxAgeContext, MetadataGeneratorContext,
};
use normcache_core::record::{EXPIRATION_DATE, RECEIVED_DATE};
use normcache_core::{
    collect_fields, CacheHeaders, CacheKey, CompiledField, ErrorValue, FieldMetadata, FieldType,
    Object, Path, PathElement, Record, Selection, Value, Variables,
};
use tracing::debug;

use crate::policies::CachePolicies;

/// An error entry of a response, located by its path.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub message: String,
    pub path: Path,
}

impl ResponseError {
    pub fn new(message: impl Into<String>, path: Path) -> Self {
        Self {
            message: message.into(),
            path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub variables: Variables,
    pub headers: CacheHeaders,
    pub errors: Vec<ResponseError>,
}

impl NormalizeOptions {
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_headers(mut self, headers: CacheHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_errors(mut self, errors: Vec<ResponseError>) -> Self {
        self.errors = errors;
        self
    }
}

/// Flatten `data` into records keyed by cache key.
///
/// Several occurrences of the same object are unioned into one record.
/// A `null` at the path of a response error is stored as an Error value.
pub fn normalize(
    data: &Object,
    selections: &[Selection],
    root_type: &str,
    root_key: &CacheKey,
    policies: &CachePolicies,
    options: &NormalizeOptions,
) -> HashMap<CacheKey, Record> {
    let mut normalizer = Normalizer {
        policies,
        options,
        errors: options
            .errors
            .iter()
            .map(|e| (e.path.clone(), e.message.clone()))
            .collect(),
        records: HashMap::new(),
    };
    normalizer.build_record(
        data,
        root_key.clone(),
        selections,
        root_type,
        &Vec::new(),
        &Vec::new(),
    );
    debug!(records = normalizer.records.len(), root = %root_key, "normalized response");
    normalizer.records
}

struct Normalizer<'a> {
    policies: &'a CachePolicies,
    options: &'a NormalizeOptions,
    errors: HashMap<Path, String>,
    records: HashMap<CacheKey, Record>,
}

/// Where in the response and the schema a value sits.
struct Position<'p> {
    path: &'p Path,
    field_path: &'p [FieldInfo],
    /// Key children without an identity are derived from.
    path_key: CacheKey,
}

impl Normalizer<'_> {
    fn build_record(
        &mut self,
        obj: &Object,
        key: CacheKey,
        selections: &[Selection],
        parent_type: &str,
        path: &Path,
        field_path: &[FieldInfo],
    ) {
        let position = Position {
            path,
            field_path,
            path_key: key.clone(),
        };
        let (fields, metadata) = self.build_fields(obj, selections, parent_type, &position);
        let record = Record {
            key: key.clone(),
            fields,
            metadata,
            mutation_id: None,
        };
        match self.records.get_mut(&key) {
            Some(existing) => existing.union_with(record),
            None => {
                self.records.insert(key, record);
            }
        }
    }

    fn build_fields(
        &mut self,
        obj: &Object,
        selections: &[Selection],
        parent_type: &str,
        position: &Position<'_>,
    ) -> (Object, BTreeMap<String, FieldMetadata>) {
        let typename = obj.get("__typename").and_then(Value::as_str);
        let owner_type = typename.unwrap_or(parent_type).to_string();
        let options = self.options;
        let variables = &options.variables;
        let mut fields = Object::new();
        let mut metadata = BTreeMap::new();

        for field in collect_fields(selections, parent_type, typename, variables) {
            let response_name = field.response_name();
            let Some(raw) = obj.get(response_name) else {
                continue;
            };

            let mut path = position.path.clone();
            path.push(PathElement::Field(response_name.to_string()));
            let mut field_path = position.field_path.to_vec();
            field_path.push(FieldInfo::new(
                owner_type.as_str(),
                field.name.as_str(),
                field.raw_type().name.as_str(),
                field.ty.is_composite(),
            ));

            let max_age = self
                .policies
                .max_age_provider
                .max_age(&MaxAgeContext::new(field_path.clone()));
            if max_age.is_zero() {
                continue;
            }

            let field_key = self.policies.field_key_generator.field_key(&FieldKeyContext {
                parent_type: &owner_type,
                field: &field,
                variables,
            });
            let embedded = self
                .policies
                .embedded_fields
                .is_embedded(&owner_type, &field.name);

            let mut field_metadata = self.policies.metadata_generator.metadata_for_object(
                raw,
                &MetadataGeneratorContext {
                    field: &field,
                    variables,
                },
            );
            self.stamp_dates(&mut field_metadata);
            if !field_metadata.is_empty() {
                metadata.insert(field_key.clone(), field_metadata);
            }

            let child = Position {
                path: &path,
                field_path: &field_path,
                path_key: position.path_key.child(&field_key),
            };
            let value = self.replace_objects(raw, &field, &field.ty, embedded, &child);
            fields.insert(field_key, value);
        }
        (fields, metadata)
    }

    fn stamp_dates(&self, metadata: &mut FieldMetadata) {
        let headers = &self.options.headers;
        if let Some(received) = headers.received_date() {
            metadata.insert(RECEIVED_DATE.to_string(), Value::Int(received));
        }
        if let Some(expires) = headers.expiration_date() {
            metadata.insert(EXPIRATION_DATE.to_string(), Value::Int(expires));
        }
    }

    fn replace_objects(
        &mut self,
        value: &Value,
        field: &CompiledField,
        ty: &FieldType,
        embedded: bool,
        position: &Position<'_>,
    ) -> Value {
        match value {
            Value::Null => match self.errors.get(position.path) {
                Some(message) => {
                    Value::Error(ErrorValue::new(message.clone(), position.path.clone()))
                }
                None => Value::Null,
            },
            Value::List(items) => {
                let item_ty = ty.list_item().unwrap_or(ty);
                let mut replaced = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let mut path = position.path.clone();
                    path.push(PathElement::Index(i));
                    let child = Position {
                        path: &path,
                        field_path: position.field_path,
                        path_key: position.path_key.indexed(i),
                    };
                    replaced.push(self.replace_objects(item, field, item_ty, embedded, &child));
                }
                Value::List(replaced)
            }
            Value::Object(obj) if ty.is_composite() => {
                let raw_type = ty.raw_type().name.as_str();
                if embedded {
                    let (fields, _) = self.build_fields(obj, &field.selections, raw_type, position);
                    return Value::Object(fields);
                }
                let key = self
                    .policies
                    .cache_key_generator
                    .cache_key_for_object(
                        obj,
                        &CacheKeyGeneratorContext {
                            field,
                            variables: &self.options.variables,
                        },
                    )
                    .unwrap_or_else(|| position.path_key.clone());
                self.build_record(
                    obj,
                    key.clone(),
                    &field.selections,
                    raw_type,
                    position.path,
                    position.field_path,
                );
                Value::Reference(key)
            }
            other => other.clone(),
        }
    }
}
