//! Batched cache reads
//!
//! Reads proceed breadth-first: each round loads every record the previous
//! round referenced with a single `load_records` call. Resolved objects land
//! in a map keyed by response path; [`to_response`] then assembles the tree
//! and applies null propagation.

use std::collections::{BTreeMap, HashMap, HashSet};

use normcache_core::policy::{FieldInfo, MaxAgeContext};
use normcache_core::{
    collect_fields, CacheError, CacheHeaders, CacheKey, CacheResult, CompiledField, ErrorValue,
    FieldMetadata, FieldType, MissError, Object, Path, PathElement, ReadMode, Selection, Value,
    Variables,
};
use normcache_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::policies::CachePolicies;
use crate::resolver::ResolverContext;

/// What to read and how.
pub struct ReadRequest<'a> {
    pub root_key: CacheKey,
    pub root_type: &'a str,
    pub selections: &'a [Selection],
    pub variables: &'a Variables,
    pub mode: ReadMode,
    pub headers: &'a CacheHeaders,
    /// Current time in unix seconds.
    pub now: i64,
    pub cancel: Option<&'a CancellationToken>,
}

/// One resolved object, or the miss that replaced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSlot {
    /// Field values by response name. Composite values are placeholders;
    /// their content lives at the child path.
    Resolved {
        typename: Option<String>,
        parent_type: String,
        fields: Object,
    },
    Missing(ErrorValue),
}

/// Path-indexed output of a batched read.
#[derive(Debug, Clone, Default)]
pub struct BatchReaderData {
    pub data: HashMap<Path, ObjectSlot>,
    pub errors: Vec<ErrorValue>,
    pub is_stale: bool,
    /// Keys of every record the read loaded.
    pub loaded_keys: HashSet<CacheKey>,
}

/// A response assembled from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// `None` when a miss under non-null fields nulled the root.
    pub data: Option<Value>,
    pub errors: Vec<ErrorValue>,
    pub is_stale: bool,
}

impl ReadResult {
    pub fn to_json(&self) -> serde_json::Value {
        self.data
            .as_ref()
            .map(Value::to_json)
            .unwrap_or(serde_json::Value::Null)
    }
}

struct PendingObject {
    key: CacheKey,
    path: Path,
    field_path: Vec<FieldInfo>,
    selections: Vec<Selection>,
    parent_type: String,
}

/// Reads a selection tree out of a storage.
pub struct BatchReader<'a> {
    storage: &'a dyn Storage,
    policies: &'a CachePolicies,
}

impl<'a> BatchReader<'a> {
    pub fn new(storage: &'a dyn Storage, policies: &'a CachePolicies) -> Self {
        Self { storage, policies }
    }

    /// Resolve every selected field, one storage round trip per depth level.
    ///
    /// In [`ReadMode::Throw`] the first miss aborts the read. In
    /// [`ReadMode::Partial`] each miss becomes an Error value at its path.
    pub fn read(&self, request: &ReadRequest<'_>) -> CacheResult<BatchReaderData> {
        let mut out = BatchReaderData::default();
        let mut pending = vec![PendingObject {
            key: request.root_key.clone(),
            path: Path::new(),
            field_path: Vec::new(),
            selections: request.selections.to_vec(),
            parent_type: request.root_type.to_string(),
        }];
        let mut round = 0usize;

        while !pending.is_empty() {
            if request.cancel.map(|t| t.is_cancelled()).unwrap_or(false) {
                debug!(round, "read cancelled");
                return Err(CacheError::Cancelled);
            }
            round += 1;

            let mut seen = HashSet::new();
            let keys: Vec<CacheKey> = pending
                .iter()
                .filter(|p| seen.insert(p.key.clone()))
                .map(|p| p.key.clone())
                .collect();
            let records: HashMap<CacheKey, _> = self
                .storage
                .load_records(&keys, request.headers)?
                .into_iter()
                .map(|r| (r.key.clone(), r))
                .collect();
            trace!(round, keys = keys.len(), loaded = records.len(), "read round");
            out.loaded_keys.extend(records.keys().cloned());

            let mut next = Vec::new();
            for item in pending.drain(..) {
                match records.get(&item.key) {
                    Some(record) => {
                        let typename = record
                            .typename()
                            .or_else(|| record.key.root_type_name())
                            .map(str::to_string);
                        self.resolve_object(
                            request,
                            &record.fields,
                            &record.metadata,
                            &record.key,
                            typename,
                            item,
                            &mut next,
                            &mut out,
                        )?;
                    }
                    // A root that was never written reads as empty.
                    None if item.path.is_empty() => {
                        let typename = item.key.root_type_name().map(str::to_string);
                        let key = item.key.clone();
                        self.resolve_object(
                            request,
                            &Object::new(),
                            &BTreeMap::new(),
                            &key,
                            typename,
                            item,
                            &mut next,
                            &mut out,
                        )?;
                    }
                    None => {
                        let miss = MissError::record(item.key.as_str());
                        let error = self.miss(request, miss, &item.path, &mut out)?;
                        out.data.insert(item.path, ObjectSlot::Missing(error));
                    }
                }
            }
            pending = next;
        }

        debug!(
            rounds = round,
            records = out.loaded_keys.len(),
            errors = out.errors.len(),
            stale = out.is_stale,
            "batched read"
        );
        Ok(out)
    }

    fn miss(
        &self,
        request: &ReadRequest<'_>,
        miss: MissError,
        path: &Path,
        out: &mut BatchReaderData,
    ) -> CacheResult<ErrorValue> {
        match request.mode {
            ReadMode::Throw => Err(miss.into()),
            ReadMode::Partial => {
                warn!(path = %normcache_core::format_path(path), error = %miss, "partial read miss");
                let error = ErrorValue::new(miss.to_string(), path.clone());
                out.errors.push(error.clone());
                Ok(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_object(
        &self,
        request: &ReadRequest<'_>,
        fields: &Object,
        metadata: &BTreeMap<String, FieldMetadata>,
        key: &CacheKey,
        typename: Option<String>,
        item: PendingObject,
        next: &mut Vec<PendingObject>,
        out: &mut BatchReaderData,
    ) -> CacheResult<()> {
        let typename = fields
            .get("__typename")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(typename);
        let owner_type = typename.clone().unwrap_or_else(|| item.parent_type.clone());
        let collected = collect_fields(
            &item.selections,
            &item.parent_type,
            typename.as_deref(),
            request.variables,
        );

        let mut resolved_fields = Object::new();
        for field in collected {
            let mut path = item.path.clone();
            path.push(PathElement::Field(field.response_name().to_string()));
            let mut field_path = item.field_path.clone();
            field_path.push(FieldInfo::new(
                owner_type.as_str(),
                field.name.as_str(),
                field.raw_type().name.as_str(),
                field.ty.is_composite(),
            ));
            let max_age_context = MaxAgeContext::new(field_path);

            let context = ResolverContext {
                field: &field,
                variables: request.variables,
                parent: fields,
                parent_metadata: metadata,
                parent_key: key,
                parent_type: &owner_type,
                headers: request.headers,
                field_key_generator: self.policies.field_key_generator.as_ref(),
                path: &max_age_context,
                now: request.now,
            };

            let value = match self.policies.resolver.resolve_field(&context) {
                Ok(resolved) => {
                    out.is_stale |= resolved.stale;
                    if let Value::Error(error) = &resolved.value {
                        out.errors.push(error.clone());
                    }
                    resolved.value
                }
                Err(miss) => Value::Error(self.miss(request, miss, &path, out)?),
            };

            if field.ty.is_composite() {
                self.schedule(
                    request,
                    &value,
                    &field,
                    &field.ty,
                    key,
                    path,
                    &max_age_context.field_path,
                    next,
                    out,
                )?;
            }
            resolved_fields.insert(field.response_name().to_string(), value);
        }

        out.data.insert(
            item.path,
            ObjectSlot::Resolved {
                typename,
                parent_type: item.parent_type,
                fields: resolved_fields,
            },
        );
        Ok(())
    }

    /// Queue referenced records for the next round; resolve embedded
    /// objects in place.
    #[allow(clippy::too_many_arguments)]
    fn schedule(
        &self,
        request: &ReadRequest<'_>,
        value: &Value,
        field: &CompiledField,
        ty: &FieldType,
        owner_key: &CacheKey,
        path: Path,
        field_path: &[FieldInfo],
        next: &mut Vec<PendingObject>,
        out: &mut BatchReaderData,
    ) -> CacheResult<()> {
        let raw_type = ty.raw_type().name.clone();
        match value {
            Value::Reference(key) => next.push(PendingObject {
                key: key.clone(),
                path,
                field_path: field_path.to_vec(),
                selections: field.selections.clone(),
                parent_type: raw_type,
            }),
            Value::Object(embedded) => {
                let item = PendingObject {
                    key: owner_key.clone(),
                    path,
                    field_path: field_path.to_vec(),
                    selections: field.selections.clone(),
                    parent_type: raw_type,
                };
                self.resolve_object(
                    request,
                    embedded,
                    &BTreeMap::new(),
                    owner_key,
                    None,
                    item,
                    next,
                    out,
                )?;
            }
            Value::List(items) => {
                let item_ty = ty.list_item().unwrap_or(ty);
                for (i, item) in items.iter().enumerate() {
                    let mut item_path = path.clone();
                    item_path.push(PathElement::Index(i));
                    self.schedule(
                        request, item, field, item_ty, owner_key, item_path, field_path, next,
                        out,
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Null propagation signal: the value at this position must become null
/// in the nearest nullable ancestor.
struct NullBubble;

/// Assemble the response tree from a batched read.
///
/// A miss in a nullable position stays an Error value at its path. A miss
/// (or null) in a non-null position nulls the nearest nullable ancestor;
/// when no such ancestor exists the data is `None`.
pub fn to_response(
    read: BatchReaderData,
    selections: &[Selection],
    variables: &Variables,
) -> ReadResult {
    let root = Path::new();
    let data = match read.data.get(&root) {
        Some(ObjectSlot::Resolved {
            typename,
            parent_type,
            fields,
        }) => complete_object(
            &read.data,
            &root,
            fields,
            typename.as_deref(),
            parent_type,
            selections,
            variables,
        )
        .ok(),
        _ => None,
    };
    ReadResult {
        data,
        errors: read.errors,
        is_stale: read.is_stale,
    }
}

fn complete_object(
    data: &HashMap<Path, ObjectSlot>,
    path: &Path,
    fields: &Object,
    typename: Option<&str>,
    parent_type: &str,
    selections: &[Selection],
    variables: &Variables,
) -> Result<Value, NullBubble> {
    let mut out = Object::new();
    for field in collect_fields(selections, parent_type, typename, variables) {
        let name = field.response_name();
        let raw = fields.get(name).unwrap_or(&Value::Null);
        let mut child_path = path.clone();
        child_path.push(PathElement::Field(name.to_string()));
        let completed = complete_value(data, &child_path, raw, &field.ty, &field, variables)?;
        out.insert(name.to_string(), completed);
    }
    Ok(Value::Object(out))
}

fn complete_value(
    data: &HashMap<Path, ObjectSlot>,
    path: &Path,
    value: &Value,
    ty: &FieldType,
    field: &CompiledField,
    variables: &Variables,
) -> Result<Value, NullBubble> {
    if let FieldType::NonNull(inner) = ty {
        let completed = complete_value(data, path, value, inner, field, variables)?;
        return match completed {
            Value::Null | Value::Error(_) => Err(NullBubble),
            other => Ok(other),
        };
    }

    match value {
        Value::Null => return Ok(Value::Null),
        Value::Error(error) => return Ok(Value::Error(error.clone())),
        _ => {}
    }

    if let Some(item_ty) = ty.list_item() {
        let Value::List(items) = value else {
            return Ok(value.clone());
        };
        let mut completed = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut item_path = path.clone();
            item_path.push(PathElement::Index(i));
            match complete_value(data, &item_path, item, item_ty, field, variables) {
                Ok(v) => completed.push(v),
                Err(NullBubble) => return Ok(Value::Null),
            }
        }
        return Ok(Value::List(completed));
    }

    if !ty.is_composite() {
        return Ok(value.clone());
    }

    match data.get(path) {
        Some(ObjectSlot::Resolved {
            typename,
            parent_type,
            fields,
        }) => Ok(complete_object(
            data,
            path,
            fields,
            typename.as_deref(),
            parent_type,
            &field.selections,
            variables,
        )
        .unwrap_or(Value::Null)),
        Some(ObjectSlot::Missing(error)) => Ok(Value::Error(error.clone())),
        None => Ok(Value::Null),
    }
}
