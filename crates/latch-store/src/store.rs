//! Session storage with a single-key atomic invoke.
//!
//! [`SessionStore::invoke`] is the only way the lock protocol touches stored
//! records. Implementations must run each processor against one key as an
//! indivisible step, linearizable per key.

use crate::processor::{EntryProcessor, MutableEntry};
use crate::record::SessionRecord;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use latch_core::config::StoreConfig;
use latch_core::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// A key/value store of session records.
pub trait SessionStore: Send + Sync {
    /// Run `processor` against the value for `key` atomically.
    ///
    /// A value staged by the processor is written only when it returns `Ok`.
    fn invoke<P: EntryProcessor>(&self, key: &str, processor: &P) -> Result<P::Output>;

    /// Snapshot of the value for `key`
    fn get(&self, key: &str) -> Option<SessionRecord>;

    /// Unconditionally replace the value for `key`
    fn put(&self, key: &str, record: SessionRecord);

    fn remove(&self, key: &str) -> Option<SessionRecord>;
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatistics {
    /// Processor runs
    pub invocations: u64,
    /// Runs that wrote a new value
    pub commits: u64,
    /// Runs that returned an error
    pub failures: u64,
    /// Records currently stored
    pub records: usize,
}

/// In-process store backed by a sharded map.
///
/// `invoke` holds the shard write lock for the key during the whole processor
/// run, which serializes all invocations on that key.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, SessionRecord>,
    stats: Arc<RwLock<StoreStatistics>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            stats: Arc::new(RwLock::new(StoreStatistics::default())),
        }
    }

    /// `shard_amount` must be a power of two greater than one
    pub fn with_shard_amount(shard_amount: usize) -> Self {
        Self {
            records: DashMap::with_shard_amount(shard_amount),
            stats: Arc::new(RwLock::new(StoreStatistics::default())),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        debug!("Creating memory store with {} shards", config.shard_amount);
        Self::with_shard_amount(config.shard_amount)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn statistics(&self) -> StoreStatistics {
        let mut stats = self.stats.read().clone();
        stats.records = self.records.len();
        stats
    }

    fn record_outcome(&self, committed: bool, failed: bool) {
        let mut stats = self.stats.write();
        stats.invocations += 1;
        if committed {
            stats.commits += 1;
        }
        if failed {
            stats.failures += 1;
        }
    }
}

impl SessionStore for MemoryStore {
    fn invoke<P: EntryProcessor>(&self, key: &str, processor: &P) -> Result<P::Output> {
        let (result, committed) = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let mut entry = MutableEntry::new(key, Some(occupied.get()));
                let result = processor.process(&mut entry);
                let staged = entry.into_staged();

                match (result.is_ok(), staged) {
                    (true, Some(value)) => {
                        occupied.insert(value);
                        (result, true)
                    }
                    _ => (result, false),
                }
            }
            Entry::Vacant(vacant) => {
                let mut entry = MutableEntry::new(key, None);
                let result = processor.process(&mut entry);
                let staged = entry.into_staged();

                match (result.is_ok(), staged) {
                    (true, Some(value)) => {
                        vacant.insert(value);
                        (result, true)
                    }
                    _ => (result, false),
                }
            }
        };

        trace!(
            "Invoked processor on '{}' (committed: {}, ok: {})",
            key,
            committed,
            result.is_ok()
        );
        self.record_outcome(committed, result.is_err());
        result
    }

    fn get(&self, key: &str) -> Option<SessionRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    fn put(&self, key: &str, record: SessionRecord) {
        self.records.insert(key.to_string(), record);
    }

    fn remove(&self, key: &str) -> Option<SessionRecord> {
        self.records.remove(key).map(|(_, record)| record)
    }
}
