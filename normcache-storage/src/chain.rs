//! Storage chaining: reads fall through, writes fan out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use normcache_core::{CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record};

use crate::merger::RecordMerger;
use crate::{Storage, StorageDump};

/// Several storages acting as one.
///
/// A load asks each storage in order for the keys still missing. Merges,
/// removals and clears go to every storage.
#[derive(Clone)]
pub struct ChainedStorage {
    storages: Vec<Arc<dyn Storage>>,
}

impl ChainedStorage {
    pub fn new(storages: Vec<Arc<dyn Storage>>) -> Self {
        Self { storages }
    }

    pub fn storages(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }
}

impl Storage for ChainedStorage {
    fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> CacheResult<Vec<Record>> {
        let mut found: HashMap<CacheKey, Record> = HashMap::new();
        let mut missing: Vec<CacheKey> = keys.to_vec();
        for storage in &self.storages {
            if missing.is_empty() {
                break;
            }
            for record in storage.load_records(&missing, headers)? {
                found.insert(record.key.clone(), record);
            }
            missing.retain(|key| !found.contains_key(key));
        }

        let mut seen = HashSet::new();
        Ok(keys
            .iter()
            .filter(|key| seen.insert((*key).clone()))
            .filter_map(|key| found.remove(key))
            .collect())
    }

    fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys> {
        let mut changed = ChangedKeys::new();
        for storage in &self.storages {
            changed.extend(storage.merge_records(records.clone(), headers, merger)?);
        }
        Ok(changed)
    }

    fn remove_keys(&self, keys: &[CacheKey], cascade: bool) -> CacheResult<usize> {
        let mut removed = 0;
        for storage in &self.storages {
            removed = removed.max(storage.remove_keys(keys, cascade)?);
        }
        Ok(removed)
    }

    fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize> {
        let mut removed = 0;
        for storage in &self.storages {
            removed = removed.max(storage.remove_by_type(types)?);
        }
        Ok(removed)
    }

    fn trim(&self, max_bytes: u64, trim_factor: f64) -> CacheResult<Option<u64>> {
        let mut total: Option<u64> = None;
        for storage in &self.storages {
            if let Some(size) = storage.trim(max_bytes, trim_factor)? {
                total = Some(total.unwrap_or(0) + size);
            }
        }
        Ok(total)
    }

    fn all_records(&self) -> CacheResult<HashMap<CacheKey, Record>> {
        let mut records = HashMap::new();
        for storage in self.storages.iter().rev() {
            records.extend(storage.all_records()?);
        }
        Ok(records)
    }

    fn dump(&self) -> CacheResult<StorageDump> {
        let mut dump = StorageDump::new();
        for storage in &self.storages {
            dump.extend(storage.dump()?);
        }
        Ok(dump)
    }

    fn clear_all(&self) -> CacheResult<()> {
        for storage in &self.storages {
            storage.clear_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmdb::LmdbStorage;
    use crate::memory::MemoryStorage;
    use crate::merger::DefaultRecordMerger;
    use normcache_core::Value;
    use tempfile::TempDir;

    fn record(key: &str, name: &str) -> Record {
        Record::new(CacheKey::new(key)).with_field("name", name)
    }

    #[test]
    fn test_reads_fall_through_in_order() {
        let front = Arc::new(MemoryStorage::new());
        let back = Arc::new(MemoryStorage::new());
        front
            .merge_record(record("User:1", "front"), &CacheHeaders::none(), &DefaultRecordMerger)
            .expect("merge");
        back.merge_records(
            vec![record("User:1", "back"), record("User:2", "back")],
            &CacheHeaders::none(),
            &DefaultRecordMerger,
        )
        .expect("merge");

        let storages: Vec<Arc<dyn Storage>> = vec![front, back];
        let chain = ChainedStorage::new(storages);
        let loaded = chain
            .load_records(
                &[CacheKey::new("User:2"), CacheKey::new("User:1")],
                &CacheHeaders::none(),
            )
            .expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].key, CacheKey::new("User:2"));
        assert_eq!(loaded[1].get("name"), Some(&Value::from("front")));
    }

    #[test]
    fn test_writes_fan_out() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let memory = Arc::new(MemoryStorage::new());
        let disk = Arc::new(LmdbStorage::open(dir.path(), 10).expect("open"));
        let storages: Vec<Arc<dyn Storage>> = vec![memory.clone(), disk.clone()];
        let chain = ChainedStorage::new(storages);

        let changed = chain
            .merge_record(record("User:1", "Ann"), &CacheHeaders::none(), &DefaultRecordMerger)
            .expect("merge");
        assert_eq!(changed.len(), 1);
        assert_eq!(memory.all_records().expect("all").len(), 1);
        assert_eq!(disk.all_records().expect("all").len(), 1);

        let dump = chain.dump().expect("dump");
        assert!(dump.contains_key("MemoryStorage"));
        assert!(dump.contains_key("LmdbStorage"));

        assert!(chain.remove(&CacheKey::new("User:1"), false).expect("remove"));
        assert!(disk.all_records().expect("all").is_empty());
        assert_eq!(chain.trim(1, 0.1).expect("trim"), Some(0));
    }
}
