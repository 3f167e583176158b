//! Write-time conflict resolution.

use normcache_core::policy::{AFTER, BEFORE, END_CURSOR, START_CURSOR};
use normcache_core::{CacheHeaders, ChangedKeys, FieldMetadata, Object, Record, Value};

/// Combines an incoming record with the stored one.
///
/// Returns the merged record and the qualified `key.field` names that were
/// added or whose value changed.
pub trait RecordMerger: Send + Sync {
    fn merge(
        &self,
        existing: &Record,
        incoming: &Record,
        headers: &CacheHeaders,
    ) -> (Record, ChangedKeys);
}

/// Merge `incoming` into an optional stored record.
///
/// A record with nothing stored under its key is written as-is and every
/// field counts as changed.
pub fn merge_into(
    existing: Option<&Record>,
    incoming: Record,
    headers: &CacheHeaders,
    merger: &dyn RecordMerger,
) -> (Record, ChangedKeys) {
    match existing {
        Some(existing) => merger.merge(existing, &incoming, headers),
        None => {
            let changed = incoming.field_keys();
            (incoming, changed)
        }
    }
}

/// Whether an incoming value must be dropped to protect a good cached one.
fn keeps_existing(existing: Option<&Value>, incoming: &Value, headers: &CacheHeaders) -> bool {
    incoming.is_error()
        && !headers.errors_replace_cached_values()
        && existing.map(|v| !v.is_error()).unwrap_or(false)
}

/// Incoming values replace stored ones, except that an Error never replaces
/// a good value unless `errors-replace-cached-values` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRecordMerger;

impl RecordMerger for DefaultRecordMerger {
    fn merge(
        &self,
        existing: &Record,
        incoming: &Record,
        headers: &CacheHeaders,
    ) -> (Record, ChangedKeys) {
        let mut merged = existing.clone();
        let mut changed = ChangedKeys::new();

        for (field_key, value) in &incoming.fields {
            let current = existing.fields.get(field_key);
            if keeps_existing(current, value, headers) {
                continue;
            }
            if !current.is_some_and(|v| v.same_as(value)) {
                changed.insert(existing.key.qualify(field_key));
            }
            merged.fields.insert(field_key.clone(), value.clone());
            if let Some(meta) = incoming.metadata.get(field_key) {
                merged
                    .metadata
                    .entry(field_key.clone())
                    .or_default()
                    .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged.mutation_id = incoming.mutation_id;
        (merged, changed)
    }
}

// ============================================================================
// FIELD-LEVEL MERGING
// ============================================================================

/// One field's value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldState {
    pub value: Value,
    pub metadata: FieldMetadata,
}

/// Combines two versions of one field.
pub trait FieldMerger: Send + Sync {
    fn merge_field(&self, field_key: &str, existing: FieldState, incoming: FieldState)
        -> FieldState;
}

/// Record merger that delegates every field present on both sides to a
/// [`FieldMerger`].
#[derive(Debug, Clone, Default)]
pub struct FieldRecordMerger<M> {
    field_merger: M,
}

impl<M: FieldMerger> FieldRecordMerger<M> {
    pub fn new(field_merger: M) -> Self {
        Self { field_merger }
    }
}

impl<M: FieldMerger> RecordMerger for FieldRecordMerger<M> {
    fn merge(
        &self,
        existing: &Record,
        incoming: &Record,
        headers: &CacheHeaders,
    ) -> (Record, ChangedKeys) {
        let mut merged = existing.clone();
        let mut changed = ChangedKeys::new();

        for (field_key, value) in &incoming.fields {
            let current = existing.fields.get(field_key);
            if keeps_existing(current, value, headers) {
                continue;
            }
            let incoming_state = FieldState {
                value: value.clone(),
                metadata: incoming.metadata.get(field_key).cloned().unwrap_or_default(),
            };
            let state = match current {
                Some(current) => self.field_merger.merge_field(
                    field_key,
                    FieldState {
                        value: current.clone(),
                        metadata: existing.metadata.get(field_key).cloned().unwrap_or_default(),
                    },
                    incoming_state,
                ),
                None => incoming_state,
            };

            if !current.is_some_and(|v| v.same_as(&state.value)) {
                changed.insert(existing.key.qualify(field_key));
            }
            merged.fields.insert(field_key.clone(), state.value);
            if state.metadata.is_empty() {
                merged.metadata.remove(field_key);
            } else {
                merged.metadata.insert(field_key.clone(), state.metadata);
            }
        }
        merged.mutation_id = incoming.mutation_id;
        (merged, changed)
    }
}

/// Merges pages of a connection by cursor adjacency.
///
/// A page whose `after` argument or start cursor equals the stored end
/// cursor is appended; a page whose `before` argument or end cursor equals
/// the stored start cursor is prepended. Anything else, including a page
/// fetched without `before`/`after`, replaces the stored list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionFieldMerger;

enum Placement {
    Append,
    Prepend,
    Reset,
}

fn cursor<'a>(metadata: &'a FieldMetadata, name: &str) -> Option<&'a Value> {
    metadata.get(name).filter(|v| !v.is_null())
}

fn edges(obj: &Object) -> Vec<Value> {
    obj.get("edges")
        .and_then(Value::as_list)
        .map(<[Value]>::to_vec)
        .unwrap_or_default()
}

fn page_flag(obj: &Object, name: &str) -> Option<Value> {
    obj.get("pageInfo")
        .and_then(Value::as_object)
        .and_then(|info| info.get(name))
        .cloned()
}

impl ConnectionFieldMerger {
    fn placement(existing: &FieldMetadata, incoming: &FieldMetadata) -> Placement {
        let after = cursor(incoming, AFTER);
        let before = cursor(incoming, BEFORE);
        if after.is_none() && before.is_none() {
            return Placement::Reset;
        }
        let (Some(existing_start), Some(existing_end)) =
            (cursor(existing, START_CURSOR), cursor(existing, END_CURSOR))
        else {
            return Placement::Reset;
        };
        let incoming_start = cursor(incoming, START_CURSOR);
        let incoming_end = cursor(incoming, END_CURSOR);

        if after == Some(existing_end) || incoming_start == Some(existing_end) {
            Placement::Append
        } else if before == Some(existing_start) || incoming_end == Some(existing_start) {
            Placement::Prepend
        } else {
            Placement::Reset
        }
    }

    fn combine(
        existing: &Object,
        incoming: &Object,
        existing_meta: &FieldMetadata,
        incoming_meta: &FieldMetadata,
        append: bool,
    ) -> (Object, FieldMetadata) {
        let (first, second, first_meta, second_meta) = if append {
            (existing, incoming, existing_meta, incoming_meta)
        } else {
            (incoming, existing, incoming_meta, existing_meta)
        };

        let mut combined_edges = edges(first);
        combined_edges.extend(edges(second));

        let mut obj = incoming.clone();
        obj.insert("edges".to_string(), Value::List(combined_edges));

        if let Some(Value::Object(mut page_info)) = incoming.get("pageInfo").cloned() {
            if let Some(v) = page_flag(first, START_CURSOR) {
                page_info.insert(START_CURSOR.to_string(), v);
            }
            if let Some(v) = page_flag(first, "hasPreviousPage") {
                page_info.insert("hasPreviousPage".to_string(), v);
            }
            if let Some(v) = page_flag(second, END_CURSOR) {
                page_info.insert(END_CURSOR.to_string(), v);
            }
            if let Some(v) = page_flag(second, "hasNextPage") {
                page_info.insert("hasNextPage".to_string(), v);
            }
            obj.insert("pageInfo".to_string(), Value::Object(page_info));
        }

        let mut metadata = incoming_meta.clone();
        metadata.remove(BEFORE);
        metadata.remove(AFTER);
        if let Some(v) = cursor(first_meta, START_CURSOR) {
            metadata.insert(START_CURSOR.to_string(), v.clone());
        }
        if let Some(v) = cursor(second_meta, END_CURSOR) {
            metadata.insert(END_CURSOR.to_string(), v.clone());
        }
        (obj, metadata)
    }
}

impl FieldMerger for ConnectionFieldMerger {
    fn merge_field(
        &self,
        _field_key: &str,
        existing: FieldState,
        incoming: FieldState,
    ) -> FieldState {
        let (Some(existing_obj), Some(incoming_obj)) =
            (existing.value.as_object(), incoming.value.as_object())
        else {
            return incoming;
        };
        if !existing_obj.contains_key("edges") || !incoming_obj.contains_key("edges") {
            return incoming;
        }

        let append = match Self::placement(&existing.metadata, &incoming.metadata) {
            Placement::Append => true,
            Placement::Prepend => false,
            Placement::Reset => return incoming,
        };
        let (obj, metadata) = Self::combine(
            existing_obj,
            incoming_obj,
            &existing.metadata,
            &incoming.metadata,
            append,
        );
        FieldState {
            value: Value::Object(obj),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normcache_core::headers::ERRORS_REPLACE_CACHED_VALUES;
    use normcache_core::{CacheKey, ErrorValue};
    use serde_json::json;

    fn user() -> Record {
        Record::new(CacheKey::new("User:1"))
    }

    fn error() -> Value {
        Value::Error(ErrorValue::new("boom", vec!["user".into(), "name".into()]))
    }

    #[test]
    fn test_default_replaces_and_reports_changes() {
        let existing = user().with_field("name", "Ann").with_field("age", 30i64);
        let incoming = user().with_field("name", "Bob").with_field("age", 30i64);
        let (merged, changed) =
            DefaultRecordMerger.merge(&existing, &incoming, &CacheHeaders::none());
        assert_eq!(merged.get("name"), Some(&Value::from("Bob")));
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("User:1.name"));
    }

    #[test]
    fn test_default_merge_is_idempotent() {
        let record = user().with_field("name", "Ann");
        let (once, _) = DefaultRecordMerger.merge(&record, &record, &CacheHeaders::none());
        let (_, changed) = DefaultRecordMerger.merge(&once, &record, &CacheHeaders::none());
        assert!(changed.is_empty());
    }

    #[test]
    fn test_nan_rewrite_reports_no_change() {
        let record = user().with_field("score", f64::NAN);
        let (once, changed) = DefaultRecordMerger.merge(&user(), &record, &CacheHeaders::none());
        assert!(changed.contains("User:1.score"));
        let (_, changed) = DefaultRecordMerger.merge(&once, &record, &CacheHeaders::none());
        assert!(changed.is_empty());

        let merger = FieldRecordMerger::new(ConnectionFieldMerger);
        let (_, changed) = merger.merge(&once, &record, &CacheHeaders::none());
        assert!(changed.is_empty());
    }

    #[test]
    fn test_error_does_not_clobber_good_value() {
        let existing = user().with_field("name", "Ann");
        let incoming = user().with_field("name", error()).with_field("bio", error());
        let (merged, changed) =
            DefaultRecordMerger.merge(&existing, &incoming, &CacheHeaders::none());
        assert_eq!(merged.get("name"), Some(&Value::from("Ann")));
        assert!(merged.get("bio").is_some_and(Value::is_error));
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_error_replaces_with_header() {
        let existing = user().with_field("name", "Ann");
        let incoming = user().with_field("name", error());
        let headers = CacheHeaders::builder()
            .flag(ERRORS_REPLACE_CACHED_VALUES)
            .build();
        let (merged, _) = DefaultRecordMerger.merge(&existing, &incoming, &headers);
        assert!(merged.get("name").is_some_and(Value::is_error));
    }

    #[test]
    fn test_metadata_union_incoming_wins() {
        let existing = user()
            .with_field("name", "Ann")
            .with_metadata("name", "a", 1i64)
            .with_metadata("name", "b", 1i64);
        let incoming = user().with_field("name", "Ann").with_metadata("name", "b", 2i64);
        let (merged, changed) =
            DefaultRecordMerger.merge(&existing, &incoming, &CacheHeaders::none());
        assert!(changed.is_empty());
        assert_eq!(merged.metadata_value("name", "a"), Some(&Value::Int(1)));
        assert_eq!(merged.metadata_value("name", "b"), Some(&Value::Int(2)));
    }

    fn page(start: &str, end: &str, names: &[&str], has_next: bool) -> Value {
        let edges: Vec<_> = names
            .iter()
            .map(|n| json!({"cursor": n, "node": {"__ref": n}}))
            .collect();
        Value::from(json!({
            "edges": edges,
            "pageInfo": {
                "startCursor": start,
                "endCursor": end,
                "hasNextPage": has_next,
                "hasPreviousPage": false
            }
        }))
    }

    fn meta(pairs: &[(&str, &str)]) -> FieldMetadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    fn edge_count(state: &FieldState) -> usize {
        state
            .value
            .as_object()
            .and_then(|o| o.get("edges"))
            .and_then(Value::as_list)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    #[test]
    fn test_connection_appends_adjacent_page() {
        let existing = FieldState {
            value: page("a", "b", &["a", "b"], true),
            metadata: meta(&[(START_CURSOR, "a"), (END_CURSOR, "b")]),
        };
        let incoming = FieldState {
            value: page("c", "d", &["c", "d"], false),
            metadata: meta(&[(START_CURSOR, "c"), (END_CURSOR, "d"), (AFTER, "b")]),
        };
        let merged = ConnectionFieldMerger.merge_field("users", existing, incoming);
        assert_eq!(edge_count(&merged), 4);
        assert_eq!(merged.metadata.get(START_CURSOR), Some(&Value::from("a")));
        assert_eq!(merged.metadata.get(END_CURSOR), Some(&Value::from("d")));
        assert!(!merged.metadata.contains_key(AFTER));
        let page_info = merged
            .value
            .as_object()
            .and_then(|o| o.get("pageInfo"))
            .and_then(Value::as_object)
            .expect("pageInfo");
        assert_eq!(page_info.get("startCursor"), Some(&Value::from("a")));
        assert_eq!(page_info.get("hasNextPage"), Some(&Value::Boolean(false)));
    }

    #[test]
    fn test_connection_prepends_adjacent_page() {
        let existing = FieldState {
            value: page("c", "d", &["c", "d"], false),
            metadata: meta(&[(START_CURSOR, "c"), (END_CURSOR, "d")]),
        };
        let incoming = FieldState {
            value: page("a", "b", &["a", "b"], true),
            metadata: meta(&[(START_CURSOR, "a"), (END_CURSOR, "b"), (BEFORE, "c")]),
        };
        let merged = ConnectionFieldMerger.merge_field("users", existing, incoming);
        assert_eq!(edge_count(&merged), 4);
        let first = merged
            .value
            .as_object()
            .and_then(|o| o.get("edges"))
            .and_then(Value::as_list)
            .and_then(|l| l.first())
            .and_then(Value::as_object)
            .and_then(|e| e.get("cursor"))
            .cloned();
        assert_eq!(first, Some(Value::from("a")));
        assert_eq!(merged.metadata.get(END_CURSOR), Some(&Value::from("d")));
    }

    #[test]
    fn test_connection_resets_on_gap_or_first_page() {
        let existing = FieldState {
            value: page("a", "b", &["a", "b"], true),
            metadata: meta(&[(START_CURSOR, "a"), (END_CURSOR, "b")]),
        };
        let gap = FieldState {
            value: page("x", "y", &["x", "y"], true),
            metadata: meta(&[(START_CURSOR, "x"), (END_CURSOR, "y"), (AFTER, "q")]),
        };
        let merged = ConnectionFieldMerger.merge_field("users", existing.clone(), gap.clone());
        assert_eq!(merged, gap);

        let first_page = FieldState {
            value: page("a", "b", &["a", "b"], true),
            metadata: meta(&[(START_CURSOR, "a"), (END_CURSOR, "b")]),
        };
        let merged = ConnectionFieldMerger.merge_field("users", existing, first_page.clone());
        assert_eq!(merged, first_page);
    }

    #[test]
    fn test_field_record_merger_uses_field_merger() {
        let merger = FieldRecordMerger::new(ConnectionFieldMerger);
        let key = CacheKey::query_root();
        let existing = Record::new(key.clone())
            .with_field("users", page("a", "b", &["a", "b"], true))
            .with_metadata("users", START_CURSOR, "a")
            .with_metadata("users", END_CURSOR, "b");
        let incoming = Record::new(key)
            .with_field("users", page("c", "d", &["c"], false))
            .with_metadata("users", START_CURSOR, "c")
            .with_metadata("users", END_CURSOR, "d")
            .with_metadata("users", AFTER, "b");
        let (merged, changed) = merger.merge(&existing, &incoming, &CacheHeaders::none());
        assert!(changed.contains("QUERY_ROOT.users"));
        let count = merged
            .get("users")
            .and_then(Value::as_object)
            .and_then(|o| o.get("edges"))
            .and_then(Value::as_list)
            .map(|l| l.len());
        assert_eq!(count, Some(3));
    }
}
