//! One independently locked shard of the entry store
//!
//! Entries live in a slot arena. The hot and cold tiers are intrusive
//! doubly linked LRU lists threaded through the arena by slot index, with
//! the most recently used entry at the head of each list.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Instant,
};

use tracing::{debug, error};

use crate::{
    Attributes, CacheError, CacheKey, Cacheable, Entry, OverflowStore, Predicate, Tier,
    index::AttributeIndex,
    overflow::StoredEntry,
    store::{Mutation, Read, Removal, RemoveOutcome, WriteOutcome},
};

/// How a mutation picks its version
#[derive(Debug, Clone, Copy)]
pub(crate) enum VersionRule {
    /// One past the key's current version
    Next,
    /// Externally assigned; rejected unless newer than the current version
    Exact(u64),
}

/// Outcome of recording a version learned from another node
pub(crate) enum Observation<K, V> {
    Stale { current: u64 },
    Applied { dropped: Option<Entry<K, V>> },
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) promotions: u64,
    pub(crate) demotions: u64,
    pub(crate) evictions: u64,
}

struct Node<K, V> {
    entry: Entry<K, V>,
    prev: Option<usize>,
    next: Option<usize>,
}

type Slots<K, V> = Vec<Option<Node<K, V>>>;

fn slot_mut<K, V>(slots: &mut [Option<Node<K, V>>], idx: usize) -> Option<&mut Node<K, V>> {
    slots.get_mut(idx).and_then(Option::as_mut)
}

#[derive(Debug, Default, Clone, Copy)]
struct LruList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl LruList {
    fn push_front<K, V>(&mut self, slots: &mut [Option<Node<K, V>>], idx: usize) {
        let old_head = self.head;
        if let Some(node) = slot_mut(slots, idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => {
                if let Some(node) = slot_mut(slots, head) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    fn unlink<K, V>(&mut self, slots: &mut [Option<Node<K, V>>], idx: usize) {
        let Some((prev, next)) = slot_mut(slots, idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = slot_mut(slots, p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = slot_mut(slots, n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = slot_mut(slots, idx) {
            node.prev = None;
            node.next = None;
        }
        self.len = self.len.saturating_sub(1);
    }
}

/// Last versions of keys that left the partition, forgotten oldest first.
///
/// A forgotten version raises `floor`, which then stands in for every key
/// without a remembered version, so versions never go backwards.
struct Tombstones<K> {
    versions: HashMap<K, u64>,
    order: VecDeque<(K, u64)>,
    capacity: usize,
    floor: u64,
}

impl<K: Hash + Eq + Clone> Tombstones<K> {
    fn new(capacity: usize) -> Self {
        Self {
            versions: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            floor: 0,
        }
    }

    fn known(&self, key: &K) -> Option<u64> {
        self.versions.get(key).copied()
    }

    fn version_of(&self, key: &K) -> u64 {
        self.known(key).unwrap_or(self.floor)
    }

    fn record(&mut self, key: K, version: u64) {
        self.versions.insert(key.clone(), version);
        self.order.push_back((key, version));
        while self.versions.len() > self.capacity {
            let Some((key, version)) = self.order.pop_front() else {
                break;
            };
            if self.versions.get(&key) == Some(&version) {
                self.versions.remove(&key);
                self.floor = self.floor.max(version);
            }
        }
        // Superseded and re-admitted keys leave dead records behind.
        if self.order.len() > self.capacity.saturating_mul(2) {
            let versions = &self.versions;
            self.order.retain(|(key, version)| versions.get(key) == Some(version));
        }
    }

    fn forget(&mut self, key: &K) {
        self.versions.remove(key);
    }
}

pub(crate) struct Partition<K, V> {
    slots: Slots<K, V>,
    free: Vec<usize>,
    map: HashMap<K, usize>,
    hot: LruList,
    cold: LruList,
    retired: Tombstones<K>,
    index: AttributeIndex<K>,
    hot_capacity: usize,
    cold_capacity: usize,
    pub(crate) counters: Counters,
}

impl<K: CacheKey, V: Cacheable> Partition<K, V> {
    pub(crate) fn new(hot_capacity: usize, cold_capacity: usize, tombstone_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            hot: LruList::default(),
            cold: LruList::default(),
            retired: Tombstones::new(tombstone_capacity),
            index: AttributeIndex::default(),
            hot_capacity,
            cold_capacity,
            counters: Counters::default(),
        }
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        slot_mut(&mut self.slots, idx)
    }

    fn resident(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.slots.iter().flatten().map(|n| &n.entry)
    }

    pub(crate) fn hot_len(&self) -> usize {
        self.hot.len
    }

    pub(crate) fn cold_len(&self) -> usize {
        self.cold.len
    }

    pub(crate) fn version_of(&self, key: &K) -> u64 {
        match self.map.get(key) {
            Some(&idx) => self.node(idx).map_or(0, |n| n.entry.version),
            None => self.retired.version_of(key),
        }
    }

    fn attach(&mut self, idx: usize, tier: Tier) {
        let list = match tier {
            Tier::Hot => &mut self.hot,
            Tier::Cold => &mut self.cold,
        };
        list.push_front(&mut self.slots, idx);
        if let Some(node) = self.node_mut(idx) {
            node.entry.tier = tier;
        }
    }

    fn detach(&mut self, idx: usize) {
        let Some(tier) = self.node(idx).map(|n| n.entry.tier) else {
            return;
        };
        let list = match tier {
            Tier::Hot => &mut self.hot,
            Tier::Cold => &mut self.cold,
        };
        list.unlink(&mut self.slots, idx);
    }

    /// Place a new entry in the arena and link it into `tier`.
    fn admit(&mut self, entry: Entry<K, V>, tier: Tier) -> usize {
        let key = entry.key.clone();
        self.retired.forget(&key);
        self.index.insert(&key, &entry.attributes);
        let node = Some(Node {
            entry,
            prev: None,
            next: None,
        });
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = node;
                idx
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.attach(idx, tier);
        idx
    }

    /// Unlink and free a slot, remembering the key's last version.
    fn release(&mut self, idx: usize) -> Option<Entry<K, V>> {
        self.detach(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        let entry = node.entry;
        self.map.remove(&entry.key);
        self.index.remove(&entry.key, &entry.attributes);
        self.retired.record(entry.key.clone(), entry.version);
        Some(entry)
    }

    pub(crate) fn put(
        &mut self,
        key: K,
        value: Arc<V>,
        attributes: Attributes,
        rule: VersionRule,
        overflow: Option<&dyn OverflowStore>,
    ) -> Mutation<K, V> {
        let current = self.version_of(&key);
        let version = match rule {
            VersionRule::Next => current + 1,
            VersionRule::Exact(v) if v > current => v,
            VersionRule::Exact(_) => {
                return Mutation {
                    outcome: WriteOutcome::Stale { current },
                    committed: None,
                    previous: None,
                    evicted: Vec::new(),
                };
            }
        };
        let now = Instant::now();

        let (idx, previous) = match self.map.get(&key).copied() {
            Some(idx) => {
                self.detach(idx);
                let previous = self.node(idx).map(|n| n.entry.clone());
                if let Some(prev) = &previous {
                    self.index.remove(&prev.key, &prev.attributes);
                }
                self.index.insert(&key, &attributes);
                if let Some(node) = self.node_mut(idx) {
                    node.entry.value = value;
                    node.entry.version = version;
                    node.entry.last_access = now;
                    node.entry.attributes = attributes;
                }
                self.attach(idx, Tier::Hot);
                (idx, previous)
            }
            None => {
                let idx = self.admit(
                    Entry {
                        key,
                        value,
                        version,
                        last_access: now,
                        tier: Tier::Hot,
                        attributes,
                    },
                    Tier::Hot,
                );
                (idx, None)
            }
        };

        let evicted = self.rebalance(overflow);
        // Hot capacity is at least one, so the entry just written is still
        // at the head of the hot list.
        let committed = self.node(idx).map(|n| n.entry.clone());
        Mutation {
            outcome: WriteOutcome::Applied { version },
            committed,
            previous,
            evicted,
        }
    }

    pub(crate) fn get(
        &mut self,
        key: &K,
        overflow: Option<&dyn OverflowStore>,
    ) -> Result<Read<K, V>, CacheError> {
        let idx = match self.map.get(key).copied() {
            Some(idx) => idx,
            None => match self.read_through(key, overflow)? {
                Some(idx) => idx,
                None => {
                    self.counters.misses += 1;
                    return Ok(Read {
                        entry: None,
                        evicted: Vec::new(),
                    });
                }
            },
        };
        self.counters.hits += 1;

        let was_cold = self.node(idx).is_some_and(|n| n.entry.tier == Tier::Cold);
        self.detach(idx);
        if let Some(node) = self.node_mut(idx) {
            node.entry.last_access = Instant::now();
        }
        self.attach(idx, Tier::Hot);

        let entry = self.node(idx).map(|n| n.entry.clone());
        let evicted = if was_cold {
            self.counters.promotions += 1;
            debug!("Promoted key {} to hot tier", key);
            self.rebalance(overflow)
        } else {
            Vec::new()
        };
        Ok(Read { entry, evicted })
    }

    /// Read without touching recency or tier.
    pub(crate) fn peek(&self, key: &K) -> Option<Entry<K, V>> {
        let idx = *self.map.get(key)?;
        self.node(idx).map(|n| n.entry.clone())
    }

    pub(crate) fn remove(
        &mut self,
        key: &K,
        rule: VersionRule,
        overflow: Option<&dyn OverflowStore>,
    ) -> Result<Removal<K, V>, CacheError> {
        let not_found = Removal {
            outcome: RemoveOutcome::NotFound,
            removed: None,
        };
        if !self.map.contains_key(key) && self.read_through(key, overflow)?.is_none() {
            return Ok(not_found);
        }

        let current = self.version_of(key);
        let version = match rule {
            VersionRule::Next => current + 1,
            VersionRule::Exact(v) if v > current => v,
            VersionRule::Exact(_) => {
                return Ok(Removal {
                    outcome: RemoveOutcome::Stale { current },
                    removed: None,
                });
            }
        };

        if let Some(store) = overflow {
            store.delete(&key.to_string())?;
        }
        let Some(idx) = self.map.get(key).copied() else {
            return Ok(not_found);
        };
        let removed = self.release(idx);
        self.retired.record(key.clone(), version);
        Ok(Removal {
            outcome: RemoveOutcome::Removed { version },
            removed,
        })
    }

    /// Record a version committed elsewhere, dropping an older resident or
    /// spilled copy.
    pub(crate) fn observe(
        &mut self,
        key: &K,
        version: u64,
        overflow: Option<&dyn OverflowStore>,
    ) -> Observation<K, V> {
        let current = self.version_of(key);
        if version <= current {
            return Observation::Stale { current };
        }
        let dropped = match self.map.get(key).copied() {
            Some(idx) => self.release(idx),
            None => None,
        };
        if let Some(store) = overflow
            && let Err(e) = store.delete(&key.to_string())
        {
            error!("Failed to drop superseded overflow copy of key {}: {}", key, e);
        }
        self.retired.record(key.clone(), version);
        Observation::Applied { dropped }
    }

    /// Load an entry spilled to the overflow store into the cold tier.
    fn read_through(
        &mut self,
        key: &K,
        overflow: Option<&dyn OverflowStore>,
    ) -> Result<Option<usize>, CacheError> {
        let Some(store) = overflow else {
            return Ok(None);
        };
        let Some(bytes) = store.load(&key.to_string())? else {
            return Ok(None);
        };
        let stored = StoredEntry::<V>::decode(&bytes)?;
        if stored.version < self.retired.known(key).unwrap_or(0) {
            debug!(
                "Ignoring superseded overflow copy of key {} (v{})",
                key, stored.version
            );
            return Ok(None);
        }
        let idx = self.admit(
            Entry {
                key: key.clone(),
                value: Arc::new(stored.value),
                version: stored.version,
                last_access: Instant::now(),
                tier: Tier::Cold,
                attributes: stored.attributes,
            },
            Tier::Cold,
        );
        Ok(Some(idx))
    }

    /// Demote hot LRU entries past capacity, then evict cold LRU entries past
    /// capacity. Returns the entries evicted from the cache.
    ///
    /// An entry whose overflow write fails stays in the cold tier, so the cold
    /// capacity is soft while the overflow store is failing. The hot capacity
    /// always holds.
    fn rebalance(&mut self, overflow: Option<&dyn OverflowStore>) -> Vec<Entry<K, V>> {
        while self.hot.len > self.hot_capacity {
            let Some(idx) = self.hot.tail else {
                break;
            };
            self.detach(idx);
            self.attach(idx, Tier::Cold);
            self.counters.demotions += 1;
        }

        let mut evicted = Vec::new();
        while self.cold.len > self.cold_capacity {
            let Some(idx) = self.cold.tail else {
                break;
            };
            if let (Some(store), Some(node)) = (overflow, self.node(idx)) {
                let entry = &node.entry;
                let written = StoredEntry::encode(entry.value.as_ref(), entry.version, &entry.attributes)
                    .and_then(|bytes| {
                        store
                            .store(&entry.key.to_string(), &bytes)
                            .map_err(CacheError::from)
                    });
                if let Err(e) = written {
                    error!(
                        "Overflow write failed for key {}: {}. Keeping entry resident.",
                        entry.key, e
                    );
                    break;
                }
            }
            if let Some(entry) = self.release(idx) {
                debug!("Evicted key {} (v{}) from cold tier", entry.key, entry.version);
                self.counters.evictions += 1;
                evicted.push(entry);
            }
        }
        evicted
    }

    pub(crate) fn add_index(&mut self, attr: &str) -> bool {
        let Self { slots, index, .. } = self;
        index.create(
            attr,
            slots
                .iter()
                .flatten()
                .map(|n| (&n.entry.key, &n.entry.attributes)),
        )
    }

    /// Keys satisfying `predicate`, resolving indexed comparisons by lookup.
    pub(crate) fn evaluate(&self, predicate: &Predicate) -> HashSet<K> {
        match predicate {
            Predicate::And(children) => {
                let mut children = children.iter();
                let Some(first) = children.next() else {
                    return HashSet::new();
                };
                let mut keys = self.evaluate(first);
                for child in children {
                    if keys.is_empty() {
                        break;
                    }
                    let narrowed = self.evaluate(child);
                    keys.retain(|k| narrowed.contains(k));
                }
                keys
            }
            Predicate::Or(children) => children.iter().flat_map(|c| self.evaluate(c)).collect(),
            Predicate::Not(child) => {
                let excluded = self.evaluate(child);
                self.map
                    .keys()
                    .filter(|k| !excluded.contains(*k))
                    .cloned()
                    .collect()
            }
            Predicate::Compare { attr, op, value } => {
                self.index.lookup(attr, *op, value).unwrap_or_else(|| {
                    self.resident()
                        .filter(|e| predicate.matches(&e.attributes))
                        .map(|e| e.key.clone())
                        .collect()
                })
            }
        }
    }

    /// Copies of the entries matching `predicate` (all entries if `None`).
    pub(crate) fn snapshot(&self, predicate: Option<&Predicate>) -> Vec<Entry<K, V>> {
        match predicate {
            Some(p) => self
                .evaluate(p)
                .iter()
                .filter_map(|k| self.peek(k))
                .collect(),
            None => self.resident().cloned().collect(),
        }
    }

    pub(crate) fn indexed(&self) -> impl Iterator<Item = &str> {
        self.index.indexed()
    }

    /// Walk both lists and the key map; panics on any broken invariant.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        fn walk<K, V>(slots: &[Option<Node<K, V>>], list: &LruList, tier: Tier) -> Vec<usize> {
            let mut seen = Vec::new();
            let mut cursor = list.head;
            while let Some(idx) = cursor {
                let node = slots[idx].as_ref().expect("linked slot is occupied");
                assert_eq!(node.entry.tier, tier);
                seen.push(idx);
                cursor = node.next;
            }
            assert_eq!(seen.len(), list.len);
            assert_eq!(seen.last().copied(), list.tail);
            seen
        }

        let hot = walk(&self.slots, &self.hot, Tier::Hot);
        let cold = walk(&self.slots, &self.cold, Tier::Cold);
        assert!(hot.len() <= self.hot_capacity);
        assert_eq!(hot.len() + cold.len(), self.map.len());
        for (key, &idx) in &self.map {
            assert!(hot.contains(&idx) ^ cold.contains(&idx), "key {key} in exactly one tier");
            assert!(self.retired.known(key).is_none());
        }
        assert!(self.retired.versions.len() <= self.retired.capacity);
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize {
        self.retired.versions.len()
    }
}
