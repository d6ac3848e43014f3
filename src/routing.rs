//! Key ownership by consistent hashing

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Display,
    ops::Bound::{Excluded, Unbounded},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{CacheError, CacheKey, Cacheable, NodeId, RemoteSource, Versioned};

/// Ring points placed per member
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Consistent-hash ring mapping keys to their owning node.
///
/// Each member is placed at `virtual_nodes` points; a key belongs to the
/// first point clockwise from its hash. Adding or removing a member only
/// moves the keys that member gains or loses.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u64, NodeId>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

fn ring_hash(label: &str) -> u64 {
    let digest = Sha256::digest(label.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
        }
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut ring = Self::default();
        for node in nodes {
            ring.add(node);
        }
        ring
    }

    pub fn add(&mut self, node: NodeId) {
        for i in 0..self.virtual_nodes {
            self.ring.insert(ring_hash(&format!("{node}:{i}")), node.clone());
        }
    }

    pub fn remove(&mut self, node: &NodeId) -> bool {
        let before = self.ring.len();
        for i in 0..self.virtual_nodes {
            let point = ring_hash(&format!("{node}:{i}"));
            if self.ring.get(&point) == Some(node) {
                self.ring.remove(&point);
            }
        }
        before != self.ring.len()
    }

    pub fn owner<K: Display>(&self, key: &K) -> Option<&NodeId> {
        let hash = ring_hash(&key.to_string());
        self.ring
            .range((Excluded(hash), Unbounded))
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.ring.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Remote source that forwards each fetch to the key's owning node.
pub struct RoutedSource<K, V> {
    ring: RwLock<HashRing>,
    members: RwLock<HashMap<NodeId, Arc<dyn RemoteSource<K, V>>>>,
}

impl<K: CacheKey, V: Cacheable> RoutedSource<K, V> {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: RwLock::new(HashRing::new(virtual_nodes)),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_member(&self, id: NodeId, source: Arc<dyn RemoteSource<K, V>>) {
        self.ring.write().add(id.clone());
        debug!("Added cluster member {}", id);
        self.members.write().insert(id, source);
    }

    pub fn remove_member(&self, id: &NodeId) -> bool {
        self.ring.write().remove(id);
        self.members.write().remove(id).is_some()
    }

    pub fn owner(&self, key: &K) -> Option<NodeId> {
        self.ring.read().owner(key).cloned()
    }
}

impl<K: CacheKey, V: Cacheable> Default for RoutedSource<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable> RemoteSource<K, V> for RoutedSource<K, V> {
    async fn fetch(&self, key: &K) -> Result<Option<Versioned<V>>, CacheError> {
        let source = self
            .owner(key)
            .and_then(|owner| self.members.read().get(&owner).cloned());
        match source {
            Some(source) => source.fetch(key).await,
            None => {
                warn!("No cluster member owns key {}", key);
                Err(CacheError::RemoteUnavailable {
                    timeout: Duration::ZERO,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, CacheNode, NearCache, NearCacheConfig, NearRead, NodeConfig};

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn removing_a_member_only_moves_its_keys() {
        let mut ring = HashRing::with_nodes(ids(&["a", "b", "c"]));
        let before: Vec<NodeId> = (0..1000u32)
            .map(|k| ring.owner(&k).unwrap().clone())
            .collect();
        for name in ["a", "b", "c"] {
            let owned = before.iter().filter(|n| n.as_str() == name).count();
            assert!(owned > 150, "{name} owns only {owned} of 1000 keys");
        }

        assert!(ring.remove(&NodeId::from("b")));
        assert!(!ring.remove(&NodeId::from("b")));
        for (k, old) in (0..1000u32).zip(&before) {
            let now = ring.owner(&k).unwrap();
            if old.as_str() != "b" {
                assert_eq!(now, old);
            }
            assert_ne!(now.as_str(), "b");
        }
        assert_eq!(ring.nodes().len(), 2);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.owner(&"sku-1"), None);
    }

    #[tokio::test]
    async fn near_cache_reads_from_the_owning_node() {
        let routed = Arc::new(RoutedSource::<u64, String>::default());
        let mut nodes = Vec::new();
        for name in ["a", "b"] {
            let node = Arc::new(
                CacheNode::<u64, String>::new(name, NodeConfig::for_namespace("products")).unwrap(),
            );
            routed.add_member(NodeId::from(name), node.clone());
            nodes.push(node);
        }
        for key in 0..20u64 {
            let owner = routed.owner(&key).unwrap();
            let node = nodes.iter().find(|n| n.id() == &owner).unwrap();
            node.put(key, format!("{owner}:{key}"), Attributes::new());
        }

        let near = NearCache::<u64, String>::new(routed.clone(), NearCacheConfig::default()).unwrap();
        for key in 0..20u64 {
            let owner = routed.owner(&key).unwrap();
            let read = near.get(&key).await.unwrap();
            assert_eq!(read.value().map(|v| v.as_str()), Some(format!("{owner}:{key}").as_str()));
        }

        for id in ids(&["a", "b"]) {
            assert!(routed.remove_member(&id));
        }
        assert!(matches!(near.get(&99).await.unwrap(), NearRead::Unavailable));
    }
}
