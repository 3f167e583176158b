//! Optimistic overlay: revocable patches layered over a base storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use normcache_core::{
    changed_fields, CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record, StorageError,
};
use tracing::debug;
use uuid::Uuid;

use crate::merger::RecordMerger;
use crate::{key_has_type, Storage, StorageDump};

/// Ordered optimistic patches for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordJournal {
    current: Record,
    history: Vec<Record>,
}

impl RecordJournal {
    pub fn new(patch: Record) -> Self {
        Self {
            current: patch.clone(),
            history: vec![patch],
        }
    }

    /// All patches folded together in order.
    pub fn current(&self) -> &Record {
        &self.current
    }

    pub fn history(&self) -> &[Record] {
        &self.history
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Append a patch and fold it over the current state.
    pub fn add_patch(&mut self, patch: Record) -> ChangedKeys {
        let next = self.current.overlay(&patch);
        let changed = changed_fields(Some(&self.current), Some(&next));
        self.current = next;
        self.history.push(patch);
        changed
    }

    /// Drop every patch of `mutation_id` and replay the rest from scratch.
    ///
    /// Returns the fields whose folded value changed. When no patch carries
    /// the id nothing changes. An emptied journal reports all its fields.
    pub fn remove_patch(&mut self, mutation_id: Uuid) -> ChangedKeys {
        let before = self.history.len();
        self.history.retain(|p| p.mutation_id != Some(mutation_id));
        if self.history.len() == before {
            return ChangedKeys::new();
        }

        let mut remaining = self.history.iter();
        let Some(first) = remaining.next() else {
            return changed_fields(Some(&self.current), None);
        };
        let replayed = remaining.fold(first.clone(), |acc, patch| acc.overlay(patch));
        let changed = changed_fields(Some(&self.current), Some(&replayed));
        self.current = replayed;
        changed
    }
}

/// Storage wrapper that shadows base records with optimistic patches.
///
/// Reads fold each key's journal over the base record; regular writes go
/// straight to the base and never touch journals.
pub struct OptimisticStorage<S> {
    base: S,
    journals: RwLock<HashMap<CacheKey, RecordJournal>>,
}

impl<S: Storage> OptimisticStorage<S> {
    pub fn new(base: S) -> Self {
        Self {
            base,
            journals: RwLock::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Record patches for `mutation_id`. Returns the visible changes.
    pub fn add_optimistic_updates(
        &self,
        records: Vec<Record>,
        mutation_id: Uuid,
    ) -> CacheResult<ChangedKeys> {
        let mut journals = self.journals.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut changed = ChangedKeys::new();
        let count = records.len();
        for mut record in records {
            record.mutation_id = Some(mutation_id);
            match journals.get_mut(&record.key) {
                Some(journal) => changed.extend(journal.add_patch(record)),
                None => {
                    changed.extend(record.field_keys());
                    journals.insert(record.key.clone(), RecordJournal::new(record));
                }
            }
        }
        debug!(%mutation_id, records = count, changed = changed.len(), "optimistic patch");
        Ok(changed)
    }

    /// Revoke every patch of `mutation_id`. Unknown ids are a no-op.
    pub fn rollback(&self, mutation_id: Uuid) -> CacheResult<ChangedKeys> {
        let mut journals = self.journals.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut changed = ChangedKeys::new();
        for journal in journals.values_mut() {
            changed.extend(journal.remove_patch(mutation_id));
        }
        journals.retain(|_, journal| !journal.is_empty());
        debug!(%mutation_id, changed = changed.len(), "optimistic rollback");
        Ok(changed)
    }

    /// Number of keys with active patches.
    pub fn journal_count(&self) -> CacheResult<usize> {
        let journals = self.journals.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(journals.len())
    }
}

impl<S: Storage> Storage for OptimisticStorage<S> {
    fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> CacheResult<Vec<Record>> {
        let mut base: HashMap<CacheKey, Record> = self
            .base
            .load_records(keys, headers)?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        let journals = self.journals.read().map_err(|_| StorageError::LockPoisoned)?;
        if journals.is_empty() {
            return Ok(keys.iter().filter_map(|k| base.remove(k)).collect());
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let stored = base.remove(key);
            let record = match (stored, journals.get(key)) {
                (Some(stored), Some(journal)) => Some(stored.overlay(journal.current())),
                (None, Some(journal)) => Some(journal.current().clone()),
                (stored, None) => stored,
            };
            records.extend(record);
        }
        Ok(records)
    }

    fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys> {
        self.base.merge_records(records, headers, merger)
    }

    fn remove_keys(&self, keys: &[CacheKey], cascade: bool) -> CacheResult<usize> {
        {
            let mut journals = self.journals.write().map_err(|_| StorageError::LockPoisoned)?;
            for key in keys {
                journals.remove(key);
            }
        }
        self.base.remove_keys(keys, cascade)
    }

    fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize> {
        {
            let mut journals = self.journals.write().map_err(|_| StorageError::LockPoisoned)?;
            journals.retain(|key, _| !key_has_type(key, types));
        }
        self.base.remove_by_type(types)
    }

    fn trim(&self, max_bytes: u64, trim_factor: f64) -> CacheResult<Option<u64>> {
        self.base.trim(max_bytes, trim_factor)
    }

    fn all_records(&self) -> CacheResult<HashMap<CacheKey, Record>> {
        let mut records = self.base.all_records()?;
        let journals = self.journals.read().map_err(|_| StorageError::LockPoisoned)?;
        for (key, journal) in journals.iter() {
            let merged = match records.get(key) {
                Some(stored) => stored.overlay(journal.current()),
                None => journal.current().clone(),
            };
            records.insert(key.clone(), merged);
        }
        Ok(records)
    }

    fn dump(&self) -> CacheResult<StorageDump> {
        let mut dump = self.base.dump()?;
        let journals = self.journals.read().map_err(|_| StorageError::LockPoisoned)?;
        let patches: BTreeMap<CacheKey, Record> = journals
            .iter()
            .map(|(key, journal)| (key.clone(), journal.current().clone()))
            .collect();
        dump.insert("OptimisticStorage".to_string(), patches);
        Ok(dump)
    }

    fn clear_all(&self) -> CacheResult<()> {
        {
            let mut journals = self.journals.write().map_err(|_| StorageError::LockPoisoned)?;
            journals.clear();
        }
        self.base.clear_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::merger::DefaultRecordMerger;
    use normcache_core::Value;

    fn key() -> CacheKey {
        CacheKey::new("User:1")
    }

    fn name(storage: &OptimisticStorage<MemoryStorage>) -> Option<Value> {
        storage
            .load_record(&key(), &CacheHeaders::none())
            .expect("load")
            .and_then(|r| r.get("name").cloned())
    }

    fn storage_with_base() -> OptimisticStorage<MemoryStorage> {
        let storage = OptimisticStorage::new(MemoryStorage::new());
        storage
            .merge_record(
                Record::new(key()).with_field("name", "base").with_field("age", 1i64),
                &CacheHeaders::none(),
                &DefaultRecordMerger,
            )
            .expect("merge");
        storage
    }

    #[test]
    fn test_patch_shadows_base() {
        let storage = storage_with_base();
        let m1 = Uuid::new_v4();
        let changed = storage
            .add_optimistic_updates(vec![Record::new(key()).with_field("name", "opt")], m1)
            .expect("patch");
        assert!(changed.contains("User:1.name"));
        assert_eq!(name(&storage), Some(Value::from("opt")));

        let loaded = storage
            .load_record(&key(), &CacheHeaders::none())
            .expect("load")
            .expect("present");
        assert_eq!(loaded.get("age"), Some(&Value::Int(1)));

        storage.rollback(m1).expect("rollback");
        assert_eq!(name(&storage), Some(Value::from("base")));
        assert_eq!(storage.journal_count().expect("count"), 0);
    }

    #[test]
    fn test_rollback_older_mutation_keeps_newer() {
        let storage = storage_with_base();
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        storage
            .add_optimistic_updates(vec![Record::new(key()).with_field("name", "one")], m1)
            .expect("patch");
        storage
            .add_optimistic_updates(vec![Record::new(key()).with_field("name", "two")], m2)
            .expect("patch");

        let changed = storage.rollback(m1).expect("rollback");
        assert!(changed.is_empty());
        assert_eq!(name(&storage), Some(Value::from("two")));

        let changed = storage.rollback(m2).expect("rollback");
        assert!(changed.contains("User:1.name"));
        assert_eq!(name(&storage), Some(Value::from("base")));
    }

    #[test]
    fn test_rollback_replays_remaining_in_order() {
        let mut journal = RecordJournal::new(
            Record::new(key())
                .with_field("a", 1i64)
                .with_field("b", 1i64),
        );
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        let mut p1 = Record::new(key()).with_field("a", 2i64);
        p1.mutation_id = Some(m1);
        let mut p2 = Record::new(key()).with_field("b", 3i64);
        p2.mutation_id = Some(m2);
        journal.add_patch(p1);
        journal.add_patch(p2);

        let changed = journal.remove_patch(m1);
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("User:1.a"));
        assert_eq!(journal.current().get("a"), Some(&Value::Int(1)));
        assert_eq!(journal.current().get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_unknown_mutation_is_noop() {
        let storage = storage_with_base();
        let changed = storage.rollback(Uuid::new_v4()).expect("rollback");
        assert!(changed.is_empty());
        assert_eq!(name(&storage), Some(Value::from("base")));
    }

    #[test]
    fn test_patch_without_base_record() {
        let storage = OptimisticStorage::new(MemoryStorage::new());
        let m1 = Uuid::new_v4();
        storage
            .add_optimistic_updates(vec![Record::new(key()).with_field("name", "ghost")], m1)
            .expect("patch");
        assert_eq!(name(&storage), Some(Value::from("ghost")));
        assert!(storage.base().all_records().expect("all").is_empty());

        let changed = storage.rollback(m1).expect("rollback");
        assert!(changed.contains("User:1.name"));
        assert_eq!(name(&storage), None);
    }

    #[test]
    fn test_dump_exposes_patches() {
        let storage = storage_with_base();
        storage
            .add_optimistic_updates(
                vec![Record::new(key()).with_field("name", "opt")],
                Uuid::new_v4(),
            )
            .expect("patch");
        let dump = storage.dump().expect("dump");
        assert_eq!(dump["OptimisticStorage"].len(), 1);
        assert_eq!(dump["MemoryStorage"].len(), 1);
    }
}
