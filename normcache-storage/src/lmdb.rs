//! LMDB-backed record storage.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a disk-resident,
//! memory-mapped store. Keys are the UTF-8 cache key; values are records
//! encoded with [`crate::codec`].
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for loads and snapshots
//! - One write transaction per merge, removal or clear

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use normcache_core::{CacheError, CacheHeaders, CacheKey, CacheResult, ChangedKeys, Record, StorageError};
use tracing::debug;

use crate::codec::{decode_record, encode_record};
use crate::merger::{merge_into, RecordMerger};
use crate::{cascade_closure, key_has_type, Storage, StorageDump};

/// Error type for LMDB storage operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStorageError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStorageError to CacheError.
impl From<LmdbStorageError> for CacheError {
    fn from(e: LmdbStorageError) -> Self {
        CacheError::Storage(StorageError::Backend {
            reason: e.to_string(),
        })
    }
}

fn txn_error(e: heed::Error) -> LmdbStorageError {
    LmdbStorageError::Transaction(e.to_string())
}

/// Disk-resident record storage.
pub struct LmdbStorage {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbStorage {
    /// Open (or create) a store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> CacheResult<Self> {
        std::fs::create_dir_all(&path).map_err(LmdbStorageError::from)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStorageError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStorageError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self { env, db })
    }

    fn get(&self, txn: &RoTxn, key: &CacheKey) -> CacheResult<Option<Record>> {
        match self.db.get(txn, key.as_str().as_bytes()).map_err(txn_error)? {
            Some(bytes) => Ok(Some(decode_record(bytes)?)),
            None => Ok(None),
        }
    }

    fn keys_where<F>(&self, mut keep: F) -> CacheResult<Vec<CacheKey>>
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut keys = Vec::new();
        for entry in self.db.iter(&rtxn).map_err(txn_error)? {
            let (raw, _) = entry.map_err(txn_error)?;
            let key = CacheKey::new(String::from_utf8_lossy(raw).into_owned());
            if keep(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn delete_all(&self, keys: &[CacheKey]) -> CacheResult<usize> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = 0;
        for key in keys {
            if self
                .db
                .delete(&mut wtxn, key.as_str().as_bytes())
                .map_err(txn_error)?
            {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }
}

impl Storage for LmdbStorage {
    fn load_records(&self, keys: &[CacheKey], _headers: &CacheHeaders) -> CacheResult<Vec<Record>> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get(&rtxn, key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> CacheResult<ChangedKeys> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut changed = ChangedKeys::new();
        for record in records {
            let existing = self.get(&wtxn, &record.key)?;
            let (merged, record_changed) = merge_into(existing.as_ref(), record, headers, merger);
            if existing.as_ref() != Some(&merged) {
                self.db
                    .put(&mut wtxn, merged.key.as_str().as_bytes(), &encode_record(&merged))
                    .map_err(txn_error)?;
            }
            changed.extend(record_changed);
        }
        wtxn.commit().map_err(txn_error)?;
        debug!(changed = changed.len(), "lmdb merge");
        Ok(changed)
    }

    fn remove_keys(&self, keys: &[CacheKey], cascade: bool) -> CacheResult<usize> {
        let targets = if cascade {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            cascade_closure(keys, |key| self.get(&rtxn, key))?
        } else {
            keys.to_vec()
        };
        let removed = self.delete_all(&targets)?;
        debug!(removed, cascade, "lmdb remove");
        Ok(removed)
    }

    fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize> {
        let doomed = self.keys_where(|key| key_has_type(key, types))?;
        self.delete_all(&doomed)
    }

    fn trim(&self, _max_bytes: u64, _trim_factor: f64) -> CacheResult<Option<u64>> {
        Ok(None)
    }

    fn all_records(&self) -> CacheResult<HashMap<CacheKey, Record>> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut records = HashMap::new();
        for entry in self.db.iter(&rtxn).map_err(txn_error)? {
            let (_, bytes) = entry.map_err(txn_error)?;
            let record = decode_record(bytes)?;
            records.insert(record.key.clone(), record);
        }
        Ok(records)
    }

    fn dump(&self) -> CacheResult<StorageDump> {
        let records: BTreeMap<CacheKey, Record> = self.all_records()?.into_iter().collect();
        let mut dump = StorageDump::new();
        dump.insert("LmdbStorage".to_string(), records);
        Ok(dump)
    }

    fn clear_all(&self) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::DefaultRecordMerger;
    use normcache_core::{ErrorValue, Value};
    use tempfile::TempDir;

    fn create_test_storage() -> (LmdbStorage, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let storage = LmdbStorage::open(temp_dir.path(), 10).expect("storage should open");
        (storage, temp_dir)
    }

    #[test]
    fn test_merge_and_load_roundtrip() {
        let (storage, _dir) = create_test_storage();
        let record = Record::new(CacheKey::new("User:1"))
            .with_field("name", "Ann")
            .with_field("friend", CacheKey::new("User:2"))
            .with_field("bio", Value::Error(ErrorValue::new("nope", vec!["bio".into()])))
            .with_metadata("name", "received-date", 10i64);

        let changed = storage
            .merge_record(record.clone(), &CacheHeaders::none(), &DefaultRecordMerger)
            .expect("merge");
        assert_eq!(changed.len(), 3);

        let loaded = storage
            .load_record(&CacheKey::new("User:1"), &CacheHeaders::none())
            .expect("load");
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let storage = LmdbStorage::open(temp_dir.path(), 10).expect("open");
            storage
                .merge_record(
                    Record::new(CacheKey::new("User:1")).with_field("name", "Ann"),
                    &CacheHeaders::none(),
                    &DefaultRecordMerger,
                )
                .expect("merge");
        }
        let storage = LmdbStorage::open(temp_dir.path(), 10).expect("reopen");
        assert_eq!(storage.all_records().expect("all").len(), 1);
    }

    #[test]
    fn test_remove_cascade_and_by_type() {
        let (storage, _dir) = create_test_storage();
        storage
            .merge_records(
                vec![
                    Record::new(CacheKey::new("Repository:1"))
                        .with_field("owner", CacheKey::new("User:1")),
                    Record::new(CacheKey::new("User:1")).with_field("name", "Ann"),
                    Record::new(CacheKey::new("User:2")).with_field("name", "Bob"),
                ],
                &CacheHeaders::none(),
                &DefaultRecordMerger,
            )
            .expect("merge");

        assert_eq!(
            storage
                .remove_keys(&[CacheKey::new("Repository:1")], true)
                .expect("remove"),
            2
        );
        assert_eq!(storage.remove_by_type(&["User"]).expect("remove"), 1);
        assert!(storage.all_records().expect("all").is_empty());
    }

    #[test]
    fn test_trim_unsupported() {
        let (storage, _dir) = create_test_storage();
        assert_eq!(storage.trim(10, 0.1).expect("trim"), None);
    }

    #[test]
    fn test_clear_all() {
        let (storage, _dir) = create_test_storage();
        storage
            .merge_record(
                Record::new(CacheKey::new("User:1")).with_field("name", "Ann"),
                &CacheHeaders::none(),
                &DefaultRecordMerger,
            )
            .expect("merge");
        storage.clear_all().expect("clear");
        let dump = storage.dump().expect("dump");
        assert!(dump["LmdbStorage"].is_empty());
    }
}
