//! Store facade
//!
//! [`NormalizedStore`] ties normalization, merging, batched reads, the
//! optimistic overlay, garbage collection and change notification together
//! over one storage backend.
//!
//! # Thread Safety
//!
//! Reads take the gate shared; writes, removals, rollbacks and collection
//! take it exclusively. Change sets are published after the gate is
//! released, so a blocked subscriber never holds up readers.

use std::collections::HashSet;
use std::sync::RwLock;

use chrono::Utc;
use normcache_core::headers::{ERRORS_REPLACE_CACHED_VALUES, MAX_STALE, RECEIVED_DATE};
use normcache_core::{
    CacheHeaders, CacheKey, CacheResult, ChangedKeys, Object, Operation, ReadMode, Record,
    StorageError, StoreConfig, Variables,
};
use normcache_storage::{
    cascade_closure, key_has_type, ChangeBus, ChangeReceiver, OptimisticStorage, Storage,
    StorageDump,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gc::{garbage_collect, GarbageCollectResult};
use crate::normalizer::{normalize, NormalizeOptions};
use crate::policies::CachePolicies;
use crate::reader::{to_response, BatchReader, ReadRequest, ReadResult};

/// Options for a single read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub variables: Variables,
    /// Overrides the configured read mode.
    pub mode: Option<ReadMode>,
    pub headers: CacheHeaders,
    pub cancel: Option<CancellationToken>,
    /// Unix seconds to evaluate freshness against; defaults to now.
    pub now: Option<i64>,
}

impl ReadOptions {
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_headers(mut self, headers: CacheHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn at(mut self, now: i64) -> Self {
        self.now = Some(now);
        self
    }
}

/// A normalized cache over storage `S`.
pub struct NormalizedStore<S> {
    storage: OptimisticStorage<S>,
    policies: CachePolicies,
    config: StoreConfig,
    gate: RwLock<()>,
    changes: ChangeBus,
}

impl<S: Storage> NormalizedStore<S> {
    /// Create a store. Fails when `config` does not validate.
    pub fn new(base: S, policies: CachePolicies, config: StoreConfig) -> CacheResult<Self> {
        config.validate()?;
        info!(
            default_max_age_secs = config.default_max_age_secs,
            read_mode = ?config.read_mode,
            "normalized store created"
        );
        Ok(Self {
            storage: OptimisticStorage::new(base),
            changes: ChangeBus::new(config.change_buffer_capacity),
            policies,
            config,
            gate: RwLock::new(()),
        })
    }

    /// Default configuration and the matching default policies.
    pub fn with_defaults(base: S) -> CacheResult<Self> {
        let config = StoreConfig::default();
        let policies = CachePolicies::for_config(&config);
        Self::new(base, policies, config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn policies(&self) -> &CachePolicies {
        &self.policies
    }

    pub fn storage(&self) -> &OptimisticStorage<S> {
        &self.storage
    }

    /// Subscribe to the field keys changed by later writes.
    pub fn subscribe(&self) -> CacheResult<ChangeReceiver> {
        self.changes.subscribe()
    }

    fn write_headers(&self, headers: &CacheHeaders) -> CacheHeaders {
        let mut builder = headers.to_builder();
        if headers.received_date().is_none() {
            builder = builder.add(RECEIVED_DATE, Utc::now().timestamp());
        }
        if self.config.errors_replace_cached_values && !headers.has(ERRORS_REPLACE_CACHED_VALUES)
        {
            builder = builder.flag(ERRORS_REPLACE_CACHED_VALUES);
        }
        builder.build()
    }

    fn publish(&self, changed: ChangedKeys) -> CacheResult<ChangedKeys> {
        self.changes.publish(changed.clone())?;
        Ok(changed)
    }

    fn normalize_operation(
        &self,
        operation: &Operation,
        data: &Object,
        options: &NormalizeOptions,
        headers: CacheHeaders,
    ) -> Vec<Record> {
        let options = NormalizeOptions {
            headers,
            ..options.clone()
        };
        normalize(
            data,
            &operation.selections,
            operation.root_type(),
            &operation.root_key(),
            &self.policies,
            &options,
        )
        .into_values()
        .collect()
    }

    /// Normalize a response and merge it into storage.
    ///
    /// Returns the changed field keys, which are also published. Nothing is
    /// written when the `do-not-store` header is set.
    pub fn write_response(
        &self,
        operation: &Operation,
        data: &Object,
        options: &NormalizeOptions,
    ) -> CacheResult<ChangedKeys> {
        if options.headers.do_not_store() {
            debug!(operation = %operation.name, "write skipped: do-not-store");
            return Ok(ChangedKeys::new());
        }
        let headers = self.write_headers(&options.headers);
        let records = self.normalize_operation(operation, data, options, headers.clone());
        let count = records.len();

        let changed = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            self.storage
                .merge_records(records, &headers, self.policies.record_merger.as_ref())?
        };
        debug!(operation = %operation.name, records = count, changed = changed.len(), "response written");
        self.publish(changed)
    }

    /// Layer a speculative response over storage under `mutation_id`.
    pub fn write_optimistic(
        &self,
        operation: &Operation,
        data: &Object,
        options: &NormalizeOptions,
        mutation_id: Uuid,
    ) -> CacheResult<ChangedKeys> {
        let headers = self.write_headers(&options.headers);
        let records = self.normalize_operation(operation, data, options, headers);
        let changed = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            self.storage.add_optimistic_updates(records, mutation_id)?
        };
        self.publish(changed)
    }

    /// Revoke every optimistic patch of `mutation_id`.
    pub fn rollback(&self, mutation_id: Uuid) -> CacheResult<ChangedKeys> {
        let changed = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            self.storage.rollback(mutation_id)?
        };
        self.publish(changed)
    }

    /// Read an operation's selections out of the cache.
    ///
    /// With the `evict-after-read` header every record the read loaded is
    /// removed from the base storage once the read succeeds. Optimistic
    /// patches on those keys stay until their mutation is rolled back.
    pub fn read(&self, operation: &Operation, options: &ReadOptions) -> CacheResult<ReadResult> {
        let mut headers = options.headers.clone();
        if !headers.has(MAX_STALE) && self.config.max_stale_secs > 0 {
            headers = headers
                .to_builder()
                .add(MAX_STALE, self.config.max_stale_secs)
                .build();
        }
        let request = ReadRequest {
            root_key: operation.root_key(),
            root_type: operation.root_type(),
            selections: &operation.selections,
            variables: &options.variables,
            mode: options.mode.unwrap_or(self.config.read_mode),
            headers: &headers,
            now: options.now.unwrap_or_else(|| Utc::now().timestamp()),
            cancel: options.cancel.as_ref(),
        };

        let batch = {
            let _guard = self.gate.read().map_err(|_| StorageError::LockPoisoned)?;
            BatchReader::new(&self.storage, &self.policies).read(&request)?
        };

        if headers.evict_after_read() && !batch.loaded_keys.is_empty() {
            let keys: Vec<CacheKey> = batch.loaded_keys.iter().cloned().collect();
            let (evicted, changed) = {
                let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
                remove_from(self.storage.base(), &keys)?
            };
            debug!(evicted, "evicted after read");
            self.publish(changed)?;
        }
        Ok(to_response(batch, &operation.selections, &options.variables))
    }

    /// Remove one record, and with `cascade` everything it references.
    ///
    /// The closure is computed and removed under one exclusive gate, so no
    /// write can add references in between.
    pub fn remove(&self, key: &CacheKey, cascade: bool) -> CacheResult<bool> {
        let (removed, changed) = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            let targets = if cascade {
                cascade_closure(std::slice::from_ref(key), |k| {
                    self.storage.load_record(k, &CacheHeaders::none())
                })?
            } else {
                vec![key.clone()]
            };
            remove_from(&self.storage, &targets)?
        };
        self.publish(changed)?;
        debug!(key = %key, cascade, removed, "record removed");
        Ok(removed > 0)
    }

    /// Remove every record of the given types.
    pub fn remove_by_type(&self, types: &[&str]) -> CacheResult<usize> {
        let (removed, changed) = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            let mut changed = ChangedKeys::new();
            for (key, record) in self.storage.all_records()? {
                if key_has_type(&key, types) {
                    changed.extend(record.field_keys());
                }
            }
            (self.storage.remove_by_type(types)?, changed)
        };
        self.publish(changed)?;
        Ok(removed)
    }

    /// Run every collection sweep against the base storage.
    ///
    /// Optimistic patches are left alone; they disappear with their rollback.
    pub fn garbage_collect(&self, now: Option<i64>) -> CacheResult<GarbageCollectResult> {
        let now = now.unwrap_or_else(|| Utc::now().timestamp());
        let max_stale = i64::try_from(self.config.max_stale_secs).unwrap_or(i64::MAX);
        let result = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            garbage_collect(
                self.storage.base(),
                self.policies.max_age_provider.as_ref(),
                now,
                max_stale,
                &self.config.root_keys,
            )?
        };
        info!(
            stale_fields = result.removed_stale_fields.removed_fields.len(),
            dangling = result.removed_dangling_references.removed_records.len(),
            unreachable = result.removed_unreachable_records.removed_records.len(),
            "garbage collection finished"
        );
        self.publish(result.changed_keys())?;
        Ok(result)
    }

    /// Trim the backend to the configured memory budget.
    pub fn trim(&self) -> CacheResult<Option<u64>> {
        let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
        self.storage
            .trim(self.config.memory_max_bytes, self.config.trim_factor)
    }

    pub fn dump(&self) -> CacheResult<StorageDump> {
        let _guard = self.gate.read().map_err(|_| StorageError::LockPoisoned)?;
        self.storage.dump()
    }

    /// Drop every record and every optimistic patch.
    pub fn clear_all(&self) -> CacheResult<()> {
        let changed = {
            let _guard = self.gate.write().map_err(|_| StorageError::LockPoisoned)?;
            let changed: ChangedKeys = self
                .storage
                .all_records()?
                .values()
                .flat_map(Record::field_keys)
                .collect();
            self.storage.clear_all()?;
            changed
        };
        self.publish(changed)?;
        Ok(())
    }

    /// Keys of every record currently visible, optimistic patches included.
    pub fn keys(&self) -> CacheResult<HashSet<CacheKey>> {
        let _guard = self.gate.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(self.storage.all_records()?.into_keys().collect())
    }
}

/// Remove `keys` from `storage`; the caller holds the write gate.
fn remove_from(storage: &dyn Storage, keys: &[CacheKey]) -> CacheResult<(usize, ChangedKeys)> {
    let mut changed = ChangedKeys::new();
    for record in storage.load_records(keys, &CacheHeaders::none())? {
        changed.extend(record.field_keys());
    }
    Ok((storage.remove_keys(keys, false)?, changed))
}
