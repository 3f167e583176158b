//! normcache storage
//!
//! The storage contract the engine is built on, plus the backends,
//! record codec, write-time merging, optimistic overlay and change bus.
//!
//! All operations are synchronous and may block on I/O. Implementations
//! must be safe to share between threads; exclusivity across a whole
//! read-modify-write sequence is the caller's concern.

pub mod chain;
pub mod codec;
pub mod lmdb;
pub mod memory;
pub mod merger;
pub mod notify;
pub mod optimistic;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use normcache_core::{CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record};

pub use chain::ChainedStorage;
pub use codec::{decode_record, encode_record, encoded_len, CodecError};
pub use lmdb::LmdbStorage;
pub use memory::MemoryStorage;
pub use merger::{
    merge_into, ConnectionFieldMerger, DefaultRecordMerger, FieldMerger, FieldRecordMerger,
    FieldState, RecordMerger,
};
pub use notify::{ChangeBus, ChangeReceiver};
pub use optimistic::{OptimisticStorage, RecordJournal};

/// Snapshot of every backend's records, keyed by backend name.
pub type StorageDump = BTreeMap<String, BTreeMap<CacheKey, Record>>;

/// Minimal record store the engine operates on.
pub trait Storage: Send + Sync {
    fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> CacheResult<Option<Record>> {
        Ok(self
            .load_records(std::slice::from_ref(key), headers)?
            .into_iter()
            .next())
    }

    /// Batched load. Keys without a record are absent from the result.
    fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> CacheResult<Vec<Record>>;

    fn merge_record(
        &self,
        record: Record,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys> {
        self.merge_records(vec![record], headers, merger)
    }

    /// Merge records and return the qualified names of changed fields.
    fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys>;

    fn remove(&self, key: &CacheKey, cascade: bool) -> CacheResult<bool> {
        Ok(self.remove_keys(std::slice::from_ref(key), cascade)? > 0)
    }

    /// Remove records; with `cascade`, also every record they reference,
    /// transitively. Returns the number of records removed.
    fn remove_keys(&self, keys: &[CacheKey], cascade: bool) -> CacheResult<usize>;

    /// Remove every record whose key starts with `Type:` for one of `types`.
    fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize>;

    /// Shrink to `max_bytes * (1 - trim_factor)` when above `max_bytes`.
    ///
    /// Returns the new size, or `None` when the backend cannot trim.
    fn trim(&self, max_bytes: u64, trim_factor: f64) -> CacheResult<Option<u64>>;

    fn all_records(&self) -> CacheResult<HashMap<CacheKey, Record>>;

    fn dump(&self) -> CacheResult<StorageDump>;

    fn clear_all(&self) -> CacheResult<()>;
}

/// Keys reachable from `roots` by following references, roots included.
///
/// `load` is asked for each key once; cycles are harmless.
pub fn cascade_closure<F>(roots: &[CacheKey], mut load: F) -> CacheResult<Vec<CacheKey>>
where
    F: FnMut(&CacheKey) -> CacheResult<Option<Record>>,
{
    let mut visited: HashSet<CacheKey> = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<CacheKey> = roots.iter().cloned().collect();

    while let Some(key) = queue.pop_front() {
        if !visited.insert(key.clone()) {
            continue;
        }
        if let Some(record) = load(&key)? {
            for next in record.references() {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        order.push(key);
    }
    Ok(order)
}

/// Whether a key belongs to one of the given types.
pub fn key_has_type(key: &CacheKey, types: &[&str]) -> bool {
    key.type_name().map(|t| types.contains(&t)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_closure_handles_cycles() {
        let mut graph: HashMap<CacheKey, Record> = HashMap::new();
        graph.insert(
            CacheKey::new("A:1"),
            Record::new(CacheKey::new("A:1")).with_field("b", CacheKey::new("B:1")),
        );
        graph.insert(
            CacheKey::new("B:1"),
            Record::new(CacheKey::new("B:1")).with_field("a", CacheKey::new("A:1")),
        );

        let closure =
            cascade_closure(&[CacheKey::new("A:1")], |k| Ok(graph.get(k).cloned())).expect("ok");
        assert_eq!(closure.len(), 2);
    }

    #[test]
    fn test_key_has_type() {
        assert!(key_has_type(&CacheKey::new("User:1"), &["User"]));
        assert!(!key_has_type(&CacheKey::new("UserX:1"), &["User"]));
        assert!(!key_has_type(&CacheKey::new("viewer"), &["User"]));
    }
}
