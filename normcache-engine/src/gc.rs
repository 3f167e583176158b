//! Garbage collection
//!
//! Three sweeps, each reporting exactly what it removed:
//! - stale fields: fields past max-age plus the allowed staleness
//! - dangling references: fields pointing at records that no longer exist,
//!   cascading through records that end up empty
//! - unreachable records: records no root can reach through references
//!
//! Every sweep plans against a snapshot and then applies the plan, so
//! cycles and repeated references are handled with visited sets.

use std::collections::{HashMap, HashSet, VecDeque};

use normcache_core::policy::{duration_secs, FieldInfo, MaxAgeContext, MaxAgeProvider};
use normcache_core::{CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record, Value};
use normcache_storage::{DefaultRecordMerger, Storage};
use tracing::debug;

use crate::resolver::{staleness, Staleness};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemovedFieldsAndRecords {
    /// Qualified `key.field` names of every removed field.
    pub removed_fields: ChangedKeys,
    pub removed_records: HashSet<CacheKey>,
}

impl RemovedFieldsAndRecords {
    pub fn is_empty(&self) -> bool {
        self.removed_fields.is_empty() && self.removed_records.is_empty()
    }

    fn absorb(&mut self, other: RemovedFieldsAndRecords) {
        self.removed_fields.extend(other.removed_fields);
        self.removed_records.extend(other.removed_records);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GarbageCollectResult {
    pub removed_stale_fields: RemovedFieldsAndRecords,
    pub removed_dangling_references: RemovedFieldsAndRecords,
    pub removed_unreachable_records: RemovedFieldsAndRecords,
}

impl GarbageCollectResult {
    /// Every field key the collection removed, for change notification.
    pub fn changed_keys(&self) -> ChangedKeys {
        let mut keys = ChangedKeys::new();
        keys.extend(self.removed_stale_fields.removed_fields.iter().cloned());
        keys.extend(self.removed_dangling_references.removed_fields.iter().cloned());
        keys.extend(self.removed_unreachable_records.removed_fields.iter().cloned());
        keys
    }
}

/// Planned modifications against a snapshot.
#[derive(Debug, Default)]
struct Plan {
    rewritten: HashMap<CacheKey, Record>,
    removed: RemovedFieldsAndRecords,
}

impl Plan {
    fn apply(self, storage: &dyn Storage) -> CacheResult<RemovedFieldsAndRecords> {
        if !self.removed.removed_records.is_empty() {
            let keys: Vec<CacheKey> = self.removed.removed_records.iter().cloned().collect();
            storage.remove_keys(&keys, false)?;
        }
        if !self.rewritten.is_empty() {
            let keys: Vec<CacheKey> = self.rewritten.keys().cloned().collect();
            storage.remove_keys(&keys, false)?;
            storage.merge_records(
                self.rewritten.into_values().collect(),
                &CacheHeaders::none(),
                &DefaultRecordMerger,
            )?;
        }
        Ok(self.removed)
    }
}

/// Keys reachable from `roots` by following references.
///
/// Roots are included when present. Independent of record iteration order.
pub fn reachable_keys(
    records: &HashMap<CacheKey, Record>,
    roots: &[CacheKey],
) -> HashSet<CacheKey> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<&CacheKey> = roots.iter().collect();
    while let Some(key) = queue.pop_front() {
        let Some(record) = records.get(key) else {
            continue;
        };
        if !visited.insert(key.clone()) {
            continue;
        }
        for value in record.fields.values() {
            value.for_each_reference(&mut |next| {
                if !visited.contains(next) {
                    if let Some((k, _)) = records.get_key_value(next) {
                        queue.push_back(k);
                    }
                }
            });
        }
    }
    visited
}

/// Remove every record no root reaches.
pub fn remove_unreachable_records(
    storage: &dyn Storage,
    roots: &[CacheKey],
) -> CacheResult<RemovedFieldsAndRecords> {
    let records = storage.all_records()?;
    let reachable = reachable_keys(&records, roots);

    let mut plan = Plan::default();
    for (key, record) in &records {
        if !reachable.contains(key) {
            plan.removed.removed_fields.extend(record.field_keys());
            plan.removed.removed_records.insert(key.clone());
        }
    }
    debug!(
        total = records.len(),
        unreachable = plan.removed.removed_records.len(),
        "unreachable sweep"
    );
    plan.apply(storage)
}

/// Strip every field that references a gone key, removing records that end
/// up empty and continuing with whatever referenced those.
///
/// `records` must not contain the keys in `gone`.
fn plan_cascade(records: &HashMap<CacheKey, Record>, gone: HashSet<CacheKey>) -> Plan {
    let mut referrers: HashMap<&CacheKey, Vec<&CacheKey>> = HashMap::new();
    for (key, record) in records {
        for value in record.fields.values() {
            value.for_each_reference(&mut |target| {
                if let Some((target, _)) = records.get_key_value(target) {
                    referrers.entry(target).or_default().push(key);
                }
            });
        }
    }

    let mut plan = Plan::default();
    let mut gone_set = gone;
    let mut queue: VecDeque<CacheKey> = gone_set.iter().cloned().collect();
    // Referrers of keys that are not in the snapshot.
    let mut dangling_referrers: HashMap<CacheKey, Vec<&CacheKey>> = HashMap::new();
    for (key, record) in records {
        for target in record.references() {
            if gone_set.contains(&target) {
                dangling_referrers.entry(target).or_default().push(key);
            }
        }
    }

    while let Some(gone_key) = queue.pop_front() {
        let sources: Vec<&CacheKey> = match records.get_key_value(&gone_key) {
            Some((k, _)) => referrers.get(k).cloned().unwrap_or_default(),
            None => dangling_referrers.remove(&gone_key).unwrap_or_default(),
        };
        for source in sources {
            if gone_set.contains(source) {
                continue;
            }
            let Some(current) = plan.rewritten.get(source).or_else(|| records.get(source)) else {
                continue;
            };
            let mut stripped = current.clone();
            let doomed: Vec<String> = stripped
                .fields
                .iter()
                .filter(|(_, value)| value.references_any(&gone_set))
                .map(|(field, _)| field.clone())
                .collect();
            plan.removed
                .removed_fields
                .extend(stripped.strip_fields(doomed.iter()));

            if stripped.is_empty() {
                plan.rewritten.remove(source);
                plan.removed.removed_records.insert(source.clone());
                gone_set.insert(source.clone());
                queue.push_back(source.clone());
            } else {
                plan.rewritten.insert(source.clone(), stripped);
            }
        }
    }
    plan
}

/// Remove the records in `removed` and cascade through every field that
/// referenced them. Keys without a stored record only cascade.
pub fn cascade_removed(
    storage: &dyn Storage,
    removed: HashSet<CacheKey>,
) -> CacheResult<RemovedFieldsAndRecords> {
    let mut records = storage.all_records()?;
    let mut direct = RemovedFieldsAndRecords::default();
    for key in &removed {
        if let Some(record) = records.remove(key) {
            direct.removed_fields.extend(record.field_keys());
            direct.removed_records.insert(key.clone());
        }
    }
    let mut plan = plan_cascade(&records, removed);
    plan.removed.absorb(direct);
    plan.apply(storage)
}

/// Strip fields referencing records that do not exist, cascading through
/// records that end up empty.
pub fn remove_dangling_references(storage: &dyn Storage) -> CacheResult<RemovedFieldsAndRecords> {
    let records = storage.all_records()?;
    let missing: HashSet<CacheKey> = records
        .values()
        .flat_map(Record::references)
        .filter(|target| !records.contains_key(target))
        .collect();
    if missing.is_empty() {
        return Ok(RemovedFieldsAndRecords::default());
    }

    let plan = plan_cascade(&records, missing);
    debug!(
        fields = plan.removed.removed_fields.len(),
        records = plan.removed.removed_records.len(),
        "dangling reference sweep"
    );
    plan.apply(storage)
}

/// Field path the max-age provider sees for a stored field.
///
/// Stored records do not remember the operation path they came from, so
/// the record's own type stands in as the parent step.
fn stored_field_path(record: &Record, field_key: &str, value: &Value) -> MaxAgeContext {
    let record_type = record.type_name_hint().unwrap_or_default();
    let mut value_type = String::new();
    let mut is_composite = false;
    value.for_each_reference(&mut |key| {
        if !is_composite {
            value_type = key.type_name().unwrap_or_default().to_string();
            is_composite = true;
        }
    });
    if !is_composite {
        is_composite = contains_object(value);
    }

    MaxAgeContext::new(vec![
        FieldInfo::new("", "", record_type, true),
        FieldInfo::new(
            record_type,
            normcache_core::field_name_of(field_key),
            value_type,
            is_composite,
        ),
    ])
}

fn contains_object(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::List(items) => items.iter().any(contains_object),
        _ => false,
    }
}

/// Remove fields past their max-age plus `max_stale_secs`, or past a server
/// expiration by more than `max_stale_secs`.
///
/// Records left empty are removed and the removal cascades through any
/// reference to them.
///
/// Max-ages come from `stored_field_path`, not from the operation that
/// wrote the field. An inheriting field therefore resolves against its
/// record's type coordinate or the composite default, and can expire here
/// earlier or later than a read along the original path would decide.
pub fn remove_stale_fields(
    storage: &dyn Storage,
    max_age_provider: &dyn MaxAgeProvider,
    now: i64,
    max_stale_secs: i64,
) -> CacheResult<RemovedFieldsAndRecords> {
    let mut records = storage.all_records()?;
    let mut plan = Plan::default();
    let mut emptied = HashSet::new();

    for (key, record) in records.iter_mut() {
        let doomed: Vec<String> = record
            .fields
            .iter()
            .filter(|(field_key, value)| {
                let expired_by_age = record.received_date(field_key).map(|received| {
                    let context = stored_field_path(record, field_key, value);
                    let max_age = duration_secs(max_age_provider.max_age(&context));
                    let age = now.saturating_sub(received);
                    staleness(age.saturating_sub(max_age), max_stale_secs) == Staleness::Expired
                });
                let expired_by_date = record.expiration_date(field_key).map(|expires| {
                    staleness(now.saturating_sub(expires), max_stale_secs) == Staleness::Expired
                });
                expired_by_age.unwrap_or(false) || expired_by_date.unwrap_or(false)
            })
            .map(|(field_key, _)| field_key.clone())
            .collect();
        if doomed.is_empty() {
            continue;
        }

        plan.removed
            .removed_fields
            .extend(record.strip_fields(doomed.iter()));
        if record.is_empty() {
            emptied.insert(key.clone());
        } else {
            plan.rewritten.insert(key.clone(), record.clone());
        }
    }

    if !emptied.is_empty() {
        records.retain(|key, _| !emptied.contains(key));
        let cascade = plan_cascade(&records, emptied.clone());
        for (key, record) in cascade.rewritten {
            plan.rewritten.insert(key, record);
        }
        for key in &cascade.removed.removed_records {
            plan.rewritten.remove(key);
        }
        plan.removed.absorb(cascade.removed);
        plan.removed.removed_records.extend(emptied);
    }

    debug!(
        fields = plan.removed.removed_fields.len(),
        records = plan.removed.removed_records.len(),
        "stale field sweep"
    );
    plan.apply(storage)
}

/// Stale fields, then dangling references, then unreachable records.
pub fn garbage_collect(
    storage: &dyn Storage,
    max_age_provider: &dyn MaxAgeProvider,
    now: i64,
    max_stale_secs: i64,
    roots: &[CacheKey],
) -> CacheResult<GarbageCollectResult> {
    let result = GarbageCollectResult {
        removed_stale_fields: remove_stale_fields(storage, max_age_provider, now, max_stale_secs)?,
        removed_dangling_references: remove_dangling_references(storage)?,
        removed_unreachable_records: remove_unreachable_records(storage, roots)?,
    };
    debug!(changed = result.changed_keys().len(), "garbage collected");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use normcache_core::policy::{GlobalMaxAgeProvider, MaxAge, SchemaCoordinatesMaxAgeProvider};
    use normcache_core::record::RECEIVED_DATE;
    use normcache_storage::MemoryStorage;
    use std::time::Duration;

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k)
    }

    fn seed(storage: &MemoryStorage, records: Vec<Record>) {
        storage
            .merge_records(records, &CacheHeaders::none(), &DefaultRecordMerger)
            .expect("seed");
    }

    #[test]
    fn test_reachable_keys_follows_nested_references() {
        let mut records = HashMap::new();
        records.insert(
            key("QUERY_ROOT"),
            Record::new(key("QUERY_ROOT")).with_field(
                "feed",
                Value::List(vec![key("Post:1").into(), key("Post:2").into()]),
            ),
        );
        records.insert(
            key("Post:1"),
            Record::new(key("Post:1")).with_field("author", key("User:1")),
        );
        records.insert(key("Post:2"), Record::new(key("Post:2")).with_field("t", "x"));
        records.insert(key("User:1"), Record::new(key("User:1")).with_field("n", "a"));
        records.insert(key("Orphan:1"), Record::new(key("Orphan:1")).with_field("n", "a"));

        let reachable = reachable_keys(&records, &[key("QUERY_ROOT")]);
        assert_eq!(reachable.len(), 4);
        assert!(!reachable.contains(&key("Orphan:1")));
    }

    #[test]
    fn test_remove_unreachable_records() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![
                Record::new(key("QUERY_ROOT")).with_field("me", key("User:1")),
                Record::new(key("User:1")).with_field("name", "Ann"),
                Record::new(key("User:2")).with_field("name", "Bob"),
            ],
        );
        let removed = remove_unreachable_records(&storage, &CacheKey::roots()).expect("gc");
        assert_eq!(removed.removed_records, HashSet::from([key("User:2")]));
        assert!(removed.removed_fields.contains("User:2.name"));
        assert_eq!(storage.len().expect("len"), 2);
    }

    #[test]
    fn test_dangling_cascade_through_emptied_records() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![
                Record::new(key("QUERY_ROOT"))
                    .with_field("repo", key("Repository:1"))
                    .with_field("other", "kept"),
                Record::new(key("Repository:1"))
                    .with_field("starGazers", Value::List(vec![key("User:1").into()])),
            ],
        );
        let removed = remove_dangling_references(&storage).expect("gc");
        assert!(removed.removed_fields.contains("Repository:1.starGazers"));
        assert!(removed.removed_fields.contains("QUERY_ROOT.repo"));
        assert_eq!(removed.removed_records, HashSet::from([key("Repository:1")]));

        let root = storage
            .load_record(&key("QUERY_ROOT"), &CacheHeaders::none())
            .expect("load")
            .expect("root kept");
        assert_eq!(root.get("other"), Some(&Value::from("kept")));
        assert!(root.get("repo").is_none());
    }

    #[test]
    fn test_cascade_terminates_on_cycles() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![
                Record::new(key("A:1")).with_field("next", key("B:1")),
                Record::new(key("B:1"))
                    .with_field("next", key("A:1"))
                    .with_field("gone", key("Gone:1")),
            ],
        );
        let removed = cascade_removed(&storage, HashSet::from([key("Gone:1")])).expect("cascade");
        assert_eq!(removed.removed_fields, ChangedKeys::from(["B:1.gone".to_string()]));
        assert!(removed.removed_records.is_empty());

        let removed = cascade_removed(&storage, HashSet::from([key("A:1")])).expect("cascade");
        assert_eq!(removed.removed_records, HashSet::from([key("A:1"), key("B:1")]));
        assert!(storage.is_empty().expect("empty"));
    }

    #[test]
    fn test_stale_sweep_respects_per_field_max_age() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![Record::new(key("User:1"))
                .with_field("__typename", "User")
                .with_field("short", "a")
                .with_field("long", "b")
                .with_metadata("short", RECEIVED_DATE, 1_000i64)
                .with_metadata("long", RECEIVED_DATE, 1_000i64)],
        );
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::MAX)
            .with("User.short", MaxAge::Duration(Duration::from_secs(60)))
            .with("User.long", MaxAge::Duration(Duration::from_secs(90)));

        let removed = remove_stale_fields(&storage, &provider, 1_070, 0).expect("gc");
        assert_eq!(removed.removed_fields, ChangedKeys::from(["User:1.short".to_string()]));
        let user = storage
            .load_record(&key("User:1"), &CacheHeaders::none())
            .expect("load")
            .expect("kept");
        assert!(user.get("long").is_some());
        assert!(user.get("short").is_none());
        assert!(user.metadata.get("short").is_none());
    }

    #[test]
    fn test_stale_sweep_ignores_operation_parent() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![Record::new(key("User:1"))
                .with_field("__typename", "User")
                .with_field("name", "Ann")
                .with_metadata("name", RECEIVED_DATE, 1_000i64)],
        );
        // A read through `Query.user` would keep `name` for 90s.
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("Query.user", MaxAge::Duration(Duration::from_secs(90)))
            .with("User.name", MaxAge::Inherit);
        let removed = remove_stale_fields(&storage, &provider, 1_030, 0).expect("gc");
        assert_eq!(removed.removed_fields, ChangedKeys::from(["User:1.name".to_string()]));

        seed(
            &storage,
            vec![Record::new(key("User:1"))
                .with_field("name", "Ann")
                .with_metadata("name", RECEIVED_DATE, 1_000i64)],
        );
        let provider = provider.with("User", MaxAge::Duration(Duration::from_secs(90)));
        let removed = remove_stale_fields(&storage, &provider, 1_030, 0).expect("gc");
        assert!(removed.is_empty());
    }

    #[test]
    fn test_stale_sweep_removes_emptied_record_and_cascades() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![
                Record::new(key("QUERY_ROOT"))
                    .with_field("me", key("User:1"))
                    .with_field("flag", true),
                Record::new(key("User:1"))
                    .with_field("name", "Ann")
                    .with_metadata("name", RECEIVED_DATE, 0i64),
            ],
        );
        let provider = GlobalMaxAgeProvider::new(Duration::from_secs(10));
        let removed = remove_stale_fields(&storage, &provider, 100, 0).expect("gc");
        assert!(removed.removed_records.contains(&key("User:1")));
        assert!(removed.removed_fields.contains("QUERY_ROOT.me"));
        assert_eq!(storage.len().expect("len"), 1);
    }

    #[test]
    fn test_garbage_collect_runs_all_sweeps() {
        let storage = MemoryStorage::new();
        seed(
            &storage,
            vec![
                Record::new(key("QUERY_ROOT")).with_field("me", key("User:1")),
                Record::new(key("User:1")).with_field("best", key("User:9")),
                Record::new(key("Orphan:1")).with_field("x", 1i64),
            ],
        );
        let result = garbage_collect(
            &storage,
            &GlobalMaxAgeProvider::unlimited(),
            0,
            0,
            &CacheKey::roots(),
        )
        .expect("gc");
        assert!(result.removed_stale_fields.is_empty());
        assert!(result
            .removed_dangling_references
            .removed_records
            .contains(&key("User:1")));
        assert!(result
            .removed_unreachable_records
            .removed_records
            .contains(&key("Orphan:1")));
        assert!(storage.is_empty().expect("empty"));
    }
}
