//! Sharded, tiered entry storage
//!
//! Keys are spread over independently locked partitions by hash. Every
//! operation locks exactly one partition, except scans and index builds
//! which visit partitions one at a time.

use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashSet, hash_map::RandomState},
    hash::BuildHasher,
    sync::Arc,
};
use tracing::debug;

use crate::{
    Attributes, CacheError, CacheKey, Cacheable, Entry, NodeConfig, OverflowStore, Predicate,
    partition::{Observation, Partition, VersionRule},
};

/// Result of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied { version: u64 },
    /// The supplied version was not newer than the entry's current version
    Stale { current: u64 },
}

impl WriteOutcome {
    pub fn version(&self) -> Option<u64> {
        match self {
            WriteOutcome::Applied { version } => Some(*version),
            WriteOutcome::Stale { .. } => None,
        }
    }
}

/// Result of a remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed { version: u64 },
    NotFound,
    Stale { current: u64 },
}

/// A committed (or rejected) put, with what it displaced
#[derive(Debug)]
pub struct Mutation<K, V> {
    pub outcome: WriteOutcome,
    /// The entry as committed, read under the same lock as the write
    pub committed: Option<Entry<K, V>>,
    pub previous: Option<Entry<K, V>>,
    /// Entries pushed out of the cache by the capacity check
    pub evicted: Vec<Entry<K, V>>,
}

#[derive(Debug)]
pub struct Removal<K, V> {
    pub outcome: RemoveOutcome,
    pub removed: Option<Entry<K, V>>,
}

#[derive(Debug)]
pub struct Read<K, V> {
    pub entry: Option<Entry<K, V>>,
    pub evicted: Vec<Entry<K, V>>,
}

/// Point-in-time store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hot: usize,
    pub cold: usize,
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub evictions: u64,
}

/// Per-node tiered storage of cache entries
pub struct EntryStore<K, V> {
    partitions: Box<[Mutex<Partition<K, V>>]>,
    hasher: RandomState,
    overflow: Option<Arc<dyn OverflowStore>>,
    indexed: RwLock<BTreeSet<String>>,
}

impl<K: CacheKey, V: Cacheable> EntryStore<K, V> {
    pub fn new(config: &NodeConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let count = config.effective_partitions();
        if count < config.partitions {
            debug!(
                "Using {} partitions instead of {} to give each at least one hot and cold slot",
                count, config.partitions
            );
        }
        let partitions = (0..count)
            .map(|i| {
                Mutex::new(Partition::new(
                    config.share(config.hot_capacity, i),
                    config.share(config.cold_capacity, i),
                    config.share(config.tombstone_capacity, i),
                ))
            })
            .collect();
        Ok(Self {
            partitions,
            hasher: RandomState::new(),
            overflow: None,
            indexed: RwLock::new(BTreeSet::new()),
        })
    }

    /// Spill cold-tier evictions to `store` and read through it on misses.
    pub fn with_overflow(mut self, store: Arc<dyn OverflowStore>) -> Self {
        self.overflow = Some(store);
        self
    }

    /// Index of the partition owning `key`.
    pub(crate) fn slot(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize % self.partitions.len()
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, key: &K) -> &Mutex<Partition<K, V>> {
        &self.partitions[self.slot(key)]
    }

    fn overflow(&self) -> Option<&dyn OverflowStore> {
        self.overflow.as_deref()
    }

    /// Insert or update `key` in the hot tier under the next version.
    pub fn put(&self, key: K, value: Arc<V>, attributes: Attributes) -> Mutation<K, V> {
        self.partition(&key)
            .lock()
            .put(key, value, attributes, VersionRule::Next, self.overflow())
    }

    /// Insert or update `key` at an externally assigned version.
    pub fn put_versioned(
        &self,
        key: K,
        value: Arc<V>,
        attributes: Attributes,
        version: u64,
    ) -> Mutation<K, V> {
        self.partition(&key).lock().put(
            key,
            value,
            attributes,
            VersionRule::Exact(version),
            self.overflow(),
        )
    }

    pub fn get(&self, key: &K) -> Result<Read<K, V>, CacheError> {
        self.partition(key).lock().get(key, self.overflow())
    }

    /// Read without touching recency or promoting.
    pub fn peek(&self, key: &K) -> Option<Entry<K, V>> {
        self.partition(key).lock().peek(key)
    }

    pub fn remove(&self, key: &K) -> Result<Removal<K, V>, CacheError> {
        self.partition(key)
            .lock()
            .remove(key, VersionRule::Next, self.overflow())
    }

    pub fn remove_versioned(&self, key: &K, version: u64) -> Result<Removal<K, V>, CacheError> {
        self.partition(key)
            .lock()
            .remove(key, VersionRule::Exact(version), self.overflow())
    }

    /// Last version committed or observed for `key`; 0 if never seen.
    pub fn version_of(&self, key: &K) -> u64 {
        self.partition(key).lock().version_of(key)
    }

    pub(crate) fn observe(&self, key: &K, version: u64) -> Observation<K, V> {
        self.partition(key).lock().observe(key, version, self.overflow())
    }

    /// Index `attr` across all partitions. Returns false if it already was.
    pub fn add_index(&self, attr: &str) -> bool {
        let mut indexed = self.indexed.write();
        if indexed.contains(attr) {
            return false;
        }
        for partition in self.partitions.iter() {
            partition.lock().add_index(attr);
        }
        indexed.insert(attr.to_owned());
        true
    }

    pub fn indexes(&self) -> Vec<String> {
        self.indexed.read().iter().cloned().collect()
    }

    /// Keys of all entries matching `predicate`.
    pub fn evaluate(&self, predicate: &Predicate) -> Result<HashSet<K>, CacheError> {
        predicate.validate()?;
        let mut keys = HashSet::new();
        for partition in self.partitions.iter() {
            keys.extend(partition.lock().evaluate(predicate));
        }
        Ok(keys)
    }

    /// Lazily iterate entries matching `predicate`.
    pub fn scan(&self, predicate: Predicate) -> Result<Scan<'_, K, V>, CacheError> {
        predicate.validate()?;
        Ok(Scan::new(self, Some(predicate)))
    }

    /// Lazily iterate every resident entry.
    pub fn entries(&self) -> Scan<'_, K, V> {
        Scan::new(self, None)
    }

    pub fn stats(&self) -> StoreStats {
        self.partitions
            .iter()
            .fold(StoreStats::default(), |mut stats, partition| {
                let p = partition.lock();
                stats.hot += p.hot_len();
                stats.cold += p.cold_len();
                stats.hits += p.counters.hits;
                stats.misses += p.counters.misses;
                stats.promotions += p.counters.promotions;
                stats.demotions += p.counters.demotions;
                stats.evictions += p.counters.evictions;
                stats
            })
    }

    pub fn len(&self) -> usize {
        let stats = self.stats();
        stats.hot + stats.cold
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let indexed = self.indexed.read();
        for partition in self.partitions.iter() {
            let p = partition.lock();
            p.assert_consistent();
            let mut names: Vec<&str> = p.indexed().collect();
            names.sort_unstable();
            assert_eq!(names, indexed.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }
}

/// Lazy, restartable scan over an [`EntryStore`].
///
/// Each partition is snapshotted under a short lock when the scan first
/// reaches it; entries are then yielded with no lock held. Dropping the
/// scan early leaves no trace in the store.
pub struct Scan<'a, K, V> {
    store: &'a EntryStore<K, V>,
    predicate: Option<Predicate>,
    next_partition: usize,
    buffer: std::vec::IntoIter<Entry<K, V>>,
}

impl<'a, K: CacheKey, V: Cacheable> Scan<'a, K, V> {
    fn new(store: &'a EntryStore<K, V>, predicate: Option<Predicate>) -> Self {
        Self {
            store,
            predicate,
            next_partition: 0,
            buffer: Vec::new().into_iter(),
        }
    }

    /// Start over from the first partition with fresh snapshots.
    pub fn restart(&mut self) {
        self.next_partition = 0;
        self.buffer = Vec::new().into_iter();
    }
}

impl<K: CacheKey, V: Cacheable> Iterator for Scan<'_, K, V> {
    type Item = Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.next() {
                return Some(entry);
            }
            let partition = self.store.partitions.get(self.next_partition)?;
            self.next_partition += 1;
            self.buffer = partition
                .lock()
                .snapshot(self.predicate.as_ref())
                .into_iter();
        }
    }
}
