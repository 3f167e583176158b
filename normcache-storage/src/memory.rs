//! In-memory record arena with byte-weighted LRU trimming.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use normcache_core::{
    CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record, StorageError,
};
use tracing::{debug, trace};

use crate::codec::encoded_len;
use crate::merger::{merge_into, RecordMerger};
use crate::{cascade_closure, key_has_type, Storage, StorageDump};

struct Entry {
    record: Record,
    weight: u64,
    last_access: AtomicU64,
}

#[derive(Default)]
struct Arena {
    entries: HashMap<CacheKey, Entry>,
    total_bytes: u64,
}

impl Arena {
    fn insert(&mut self, record: Record, tick: u64) {
        let weight = encoded_len(&record) as u64;
        self.total_bytes += weight;
        let previous = self.entries.insert(
            record.key.clone(),
            Entry {
                record,
                weight,
                last_access: AtomicU64::new(tick),
            },
        );
        if let Some(previous) = previous {
            self.total_bytes = self.total_bytes.saturating_sub(previous.weight);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes = self.total_bytes.saturating_sub(entry.weight);
                true
            }
            None => false,
        }
    }
}

/// Records held in memory, keyed by cache key.
///
/// Each record is weighed by its encoded size. Reads take a shared lock and
/// bump an access tick so [`Storage::trim`] can evict least recently used
/// records first.
#[derive(Default)]
pub struct MemoryStorage {
    arena: RwLock<Arena>,
    clock: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current total weight in bytes.
    pub fn size_bytes(&self) -> CacheResult<u64> {
        let arena = self.arena.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(arena.total_bytes)
    }

    pub fn len(&self) -> CacheResult<usize> {
        let arena = self.arena.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(arena.entries.len())
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl Storage for MemoryStorage {
    fn load_records(&self, keys: &[CacheKey], _headers: &CacheHeaders) -> CacheResult<Vec<Record>> {
        let arena = self.arena.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = arena.entries.get(key) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                records.push(entry.record.clone());
            }
        }
        trace!(requested = keys.len(), found = records.len(), "memory load");
        Ok(records)
    }

    fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys> {
        let mut arena = self.arena.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut changed = ChangedKeys::new();
        for record in records {
            let existing = arena.entries.get(&record.key).map(|e| &e.record);
            let (merged, record_changed) = merge_into(existing, record, headers, merger);
            let unchanged = arena
                .entries
                .get(&merged.key)
                .map(|e| e.record == merged)
                .unwrap_or(false);
            if !unchanged {
                let tick = self.tick();
                arena.insert(merged, tick);
            }
            changed.extend(record_changed);
        }
        debug!(changed = changed.len(), "memory merge");
        Ok(changed)
    }

    fn remove_keys(&self, keys: &[CacheKey], cascade: bool) -> CacheResult<usize> {
        let mut arena = self.arena.write().map_err(|_| StorageError::LockPoisoned)?;
        let targets = if cascade {
            cascade_closure(keys, |key| {
                Ok(arena.entries.get(key).map(|e| e.record.clone()))
            })?
        } else {
            keys.to_vec()
        };
        let removed = targets.iter().filter(|key| arena.remove(key)).count();
        debug!(removed, cascade, "memory remove");
        Ok(removed)
    }

    fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize> {
        let mut arena = self.arena.write().map_err(|_| StorageError::LockPoisoned)?;
        let doomed: Vec<CacheKey> = arena
            .entries
            .keys()
            .filter(|key| key_has_type(key, types))
            .cloned()
            .collect();
        for key in &doomed {
            arena.remove(key);
        }
        Ok(doomed.len())
    }

    fn trim(&self, max_bytes: u64, trim_factor: f64) -> CacheResult<Option<u64>> {
        let mut arena = self.arena.write().map_err(|_| StorageError::LockPoisoned)?;
        if arena.total_bytes <= max_bytes {
            return Ok(Some(arena.total_bytes));
        }
        let target = (max_bytes as f64 * (1.0 - trim_factor)) as u64;

        let mut by_age: Vec<(u64, CacheKey)> = arena
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_access.load(Ordering::Relaxed), key.clone()))
            .collect();
        by_age.sort();

        let before = arena.total_bytes;
        let mut evicted = 0usize;
        for (_, key) in by_age {
            if arena.total_bytes <= target {
                break;
            }
            arena.remove(&key);
            evicted += 1;
        }
        debug!(before, after = arena.total_bytes, evicted, "memory trim");
        Ok(Some(arena.total_bytes))
    }

    fn all_records(&self) -> CacheResult<HashMap<CacheKey, Record>> {
        let arena = self.arena.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(arena
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect())
    }

    fn dump(&self) -> CacheResult<StorageDump> {
        let records: BTreeMap<CacheKey, Record> = self.all_records()?.into_iter().collect();
        let mut dump = StorageDump::new();
        dump.insert("MemoryStorage".to_string(), records);
        Ok(dump)
    }

    fn clear_all(&self) -> CacheResult<()> {
        let mut arena = self.arena.write().map_err(|_| StorageError::LockPoisoned)?;
        *arena = Arena::default();
        Ok(())
    }
}
