//! Change notification bus.
//!
//! Every subscriber owns a bounded channel. Publishing blocks while a
//! subscriber's buffer is full, so slow subscribers slow the publisher down
//! instead of missing invalidations.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use normcache_core::{CacheResult, ChangedKeys, StorageError};
use tracing::{debug, trace};

/// Receiving end of a subscription.
pub type ChangeReceiver = Receiver<Arc<ChangedKeys>>;

/// Multi-subscriber broadcast of changed field keys, one per store.
pub struct ChangeBus {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<Arc<ChangedKeys>>>>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> CacheResult<ChangeReceiver> {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        subscribers.push(tx);
        Ok(rx)
    }

    pub fn subscriber_count(&self) -> CacheResult<usize> {
        let subscribers = self
            .subscribers
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(subscribers.len())
    }

    /// Send `keys` to every live subscriber. Empty sets are not published.
    ///
    /// Returns the number of subscribers that received the set. Subscribers
    /// whose receiver was dropped are pruned.
    pub fn publish(&self, keys: ChangedKeys) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let senders: Vec<Sender<Arc<ChangedKeys>>> = self
            .subscribers
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone();

        let payload = Arc::new(keys);
        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for sender in senders {
            match sender.send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(_) => disconnected.push(sender),
            }
        }

        if !disconnected.is_empty() {
            let mut subscribers = self
                .subscribers
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?;
            subscribers.retain(|s| !disconnected.iter().any(|d| d.same_channel(s)));
            debug!(pruned = disconnected.len(), "change subscribers disconnected");
        }
        trace!(keys = payload.len(), delivered, "published changes");
        Ok(delivered)
    }
}
