//! Authoritative cache node
//!
//! A node owns the entries for the keys routed to it. Every committed
//! mutation first enqueues an invalidation on the bus and then runs local
//! listeners synchronously, so a slow listener never delays fan-out.
//!
//! Commit and dispatch run under a per-partition ordering lock, so the
//! events of one key reach listeners in version order. The lock is
//! reentrant: a listener may write to its own node, and the events of that
//! nested write are delivered before the outer dispatch continues.

use async_trait::async_trait;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};
use tracing::{debug, warn};

use crate::{
    Attributes, CacheError, CacheKey, Cacheable, Entry, EntryListener, EntryStore, EventKind,
    EventOrigin, InvalidationBus, InvalidationMessage, ListenerFailure, ListenerId, NodeConfig,
    NodeId, Operation, OverflowStore, Predicate, RemoteSource, RemoveOutcome, Scan, StoreStats,
    Subscription, Versioned, WriteOutcome,
    listener::{EntryEvent, ListenerRegistry},
    partition::Observation,
    store::{Mutation, Removal},
};

pub struct CacheNode<K, V> {
    id: NodeId,
    namespace: String,
    store: EntryStore<K, V>,
    listeners: ListenerRegistry<K, V>,
    bus: Option<Arc<InvalidationBus>>,
    order: Box<[ReentrantMutex<()>]>,
}

impl<K: CacheKey, V: Cacheable> CacheNode<K, V> {
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Result<Self, CacheError> {
        let store = EntryStore::new(&config)?;
        let order = (0..store.partition_count())
            .map(|_| ReentrantMutex::new(()))
            .collect();
        Ok(Self {
            id: id.into(),
            namespace: config.namespace,
            store,
            listeners: ListenerRegistry::new(config.listener_failure_capacity),
            bus: None,
            order,
        })
    }

    /// Publish invalidations for committed mutations on `bus`.
    pub fn with_bus(mut self, bus: Arc<InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spill cold-tier evictions to a persistent overflow store.
    pub fn with_overflow(mut self, overflow: Arc<dyn OverflowStore>) -> Self {
        self.store = self.store.with_overflow(overflow);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &EntryStore<K, V> {
        &self.store
    }

    /// Subscribe this node to invalidations from its peers.
    ///
    /// The subscription holds only a weak reference; it goes quiet once the
    /// node is dropped.
    pub async fn join(self: &Arc<Self>) -> Result<Subscription, CacheError> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| CacheError::InvalidConfig("node has no invalidation bus".into()))?;
        let node: Weak<Self> = Arc::downgrade(self);
        bus.subscribe::<K, _>(&self.namespace, move |message| {
            if let Some(node) = node.upgrade() {
                node.apply_invalidation(&message);
            }
        })
        .await
    }

    fn ordered(&self, key: &K) -> ReentrantMutexGuard<'_, ()> {
        self.order[self.store.slot(key)].lock()
    }

    pub fn get(&self, key: &K) -> Result<Option<Entry<K, V>>, CacheError> {
        let _order = self.ordered(key);
        let read = self.store.get(key)?;
        self.notify_evicted(read.evicted);
        Ok(read.entry)
    }

    pub fn put(&self, key: K, value: V, attributes: Attributes) -> WriteOutcome {
        let _order = self.ordered(&key);
        let mutation = self.store.put(key.clone(), Arc::new(value), attributes);
        self.after_put(key, mutation)
    }

    /// Put at an externally assigned version; stale versions are rejected.
    pub fn put_versioned(&self, key: K, value: V, attributes: Attributes, version: u64) -> WriteOutcome {
        let _order = self.ordered(&key);
        let mutation = self
            .store
            .put_versioned(key.clone(), Arc::new(value), attributes, version);
        self.after_put(key, mutation)
    }

    pub fn remove(&self, key: &K) -> Result<RemoveOutcome, CacheError> {
        let _order = self.ordered(key);
        let removal = self.store.remove(key)?;
        Ok(self.after_remove(key, removal))
    }

    pub fn remove_versioned(&self, key: &K, version: u64) -> Result<RemoveOutcome, CacheError> {
        let _order = self.ordered(key);
        let removal = self.store.remove_versioned(key, version)?;
        Ok(self.after_remove(key, removal))
    }

    pub fn scan(&self, predicate: Predicate) -> Result<Scan<'_, K, V>, CacheError> {
        self.store.scan(predicate)
    }

    pub fn add_index(&self, attr: &str) -> bool {
        let created = self.store.add_index(attr);
        if created {
            debug!("Node {} indexed attribute '{}'", self.id, attr);
        }
        created
    }

    pub fn evaluate(&self, predicate: &Predicate) -> Result<HashSet<K>, CacheError> {
        self.store.evaluate(predicate)
    }

    /// Register a listener for entry events, optionally filtered.
    ///
    /// With `include_value` false, events arrive without values.
    pub fn add_entry_listener(
        &self,
        predicate: Option<Predicate>,
        include_value: bool,
        listener: Arc<dyn EntryListener<K, V>>,
    ) -> Result<ListenerId, CacheError> {
        if let Some(predicate) = &predicate {
            predicate.validate()?;
        }
        Ok(self.listeners.register(predicate, include_value, listener))
    }

    pub fn remove_entry_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drain listener failures recorded since the last call.
    pub fn take_listener_failures(&self) -> Vec<ListenerFailure> {
        self.listeners.take_failures()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Apply a peer's invalidation. Returns false when the message was
    /// ignored: our own echo, another namespace, or not newer than what
    /// this node already knows for the key.
    pub fn apply_invalidation(&self, message: &InvalidationMessage<K>) -> bool {
        if message.origin() == &self.id || message.namespace() != self.namespace {
            return false;
        }
        let _order = self.ordered(message.key());
        let dropped = match self.store.observe(message.key(), message.version()) {
            Observation::Stale { current } => {
                debug!(
                    "Dropping stale invalidation for key {} (v{} <= v{})",
                    message.key(),
                    message.version(),
                    current
                );
                return false;
            }
            Observation::Applied { dropped } => dropped,
        };
        if let Some(entry) = &dropped {
            debug!(
                "Dropped local copy of key {} (v{}) superseded by v{} from {}",
                entry.key,
                entry.version,
                message.version(),
                message.origin()
            );
        }
        let kind = match message.op() {
            Operation::Put => EventKind::Updated,
            Operation::Delete => EventKind::Removed,
        };
        let event = EntryEvent {
            kind,
            key: message.key().clone(),
            value: None,
            old_value: dropped.as_ref().map(|e| Arc::clone(&e.value)),
            version: message.version(),
            origin: EventOrigin::Remote(message.origin().clone()),
        };
        self.listeners
            .dispatch(&event, None, dropped.as_ref().map(|e| &e.attributes));
        true
    }

    fn publish(&self, key: &K, op: Operation, version: u64) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message = InvalidationMessage::new(&self.namespace, key.clone(), op, version, self.id.clone());
        if let Err(e) = bus.publish(&message) {
            warn!(
                "Failed to publish invalidation for key {} (v{}): {}",
                key, version, e
            );
        }
    }

    fn after_put(&self, key: K, mutation: Mutation<K, V>) -> WriteOutcome {
        let Mutation {
            outcome,
            committed,
            previous,
            evicted,
        } = mutation;
        let WriteOutcome::Applied { version } = outcome else {
            debug!("Rejected stale write for key {}: {:?}", key, outcome);
            return outcome;
        };
        self.publish(&key, Operation::Put, version);

        let event = EntryEvent {
            kind: if previous.is_some() {
                EventKind::Updated
            } else {
                EventKind::Added
            },
            key,
            value: committed.as_ref().map(|e| Arc::clone(&e.value)),
            old_value: previous.as_ref().map(|e| Arc::clone(&e.value)),
            version,
            origin: EventOrigin::Local,
        };
        self.listeners.dispatch(
            &event,
            committed.as_ref().map(|e| &e.attributes),
            previous.as_ref().map(|e| &e.attributes),
        );
        self.notify_evicted(evicted);
        outcome
    }

    fn after_remove(&self, key: &K, removal: Removal<K, V>) -> RemoveOutcome {
        let RemoveOutcome::Removed { version } = removal.outcome else {
            return removal.outcome;
        };
        self.publish(key, Operation::Delete, version);
        let event = EntryEvent {
            kind: EventKind::Removed,
            key: key.clone(),
            value: None,
            old_value: removal.removed.as_ref().map(|e| Arc::clone(&e.value)),
            version,
            origin: EventOrigin::Local,
        };
        self.listeners
            .dispatch(&event, None, removal.removed.as_ref().map(|e| &e.attributes));
        removal.outcome
    }

    fn notify_evicted(&self, evicted: Vec<Entry<K, V>>) {
        for entry in evicted {
            let event = EntryEvent {
                kind: EventKind::Evicted,
                key: entry.key.clone(),
                value: None,
                old_value: Some(Arc::clone(&entry.value)),
                version: entry.version,
                origin: EventOrigin::Local,
            };
            self.listeners.dispatch(&event, None, Some(&entry.attributes));
        }
    }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable> RemoteSource<K, V> for CacheNode<K, V> {
    async fn fetch(&self, key: &K) -> Result<Option<Versioned<V>>, CacheError> {
        Ok(self.get(key)?.map(Versioned::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ListenerError, LocalTransport, Tier, attributes};
    use parking_lot::Mutex;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<(EventKind, u64, u64)>>>;

    fn node(id: &str, hot: usize, cold: usize) -> CacheNode<u64, String> {
        CacheNode::new(
            id,
            NodeConfig {
                namespace: "products".into(),
                partitions: 1,
                hot_capacity: hot,
                cold_capacity: cold,
                ..NodeConfig::default()
            },
        )
        .unwrap()
    }

    fn recorder(node: &CacheNode<u64, String>, predicate: Option<Predicate>) -> Events {
        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        node.add_entry_listener(
            predicate,
            true,
            Arc::new(move |e: &EntryEvent<u64, String>| -> Result<(), ListenerError> {
                sink.lock().push((e.kind, e.key, e.version));
                Ok(())
            }),
        )
        .unwrap();
        events
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[test]
    fn put_twice_then_demote_and_promote() {
        let node = node("a", 1, 8);
        assert_eq!(node.put(1, "A".into(), Attributes::new()), WriteOutcome::Applied { version: 1 });
        assert_eq!(node.put(1, "B".into(), Attributes::new()), WriteOutcome::Applied { version: 2 });
        let entry = node.get(&1).unwrap().unwrap();
        assert_eq!((entry.value.as_str(), entry.version), ("B", 2));

        node.put(2, "C".into(), Attributes::new());
        assert_eq!(node.store().peek(&1).unwrap().tier, Tier::Cold);

        let entry = node.get(&1).unwrap().unwrap();
        assert_eq!((entry.value.as_str(), entry.version, entry.tier), ("B", 2, Tier::Hot));
    }

    #[test]
    fn listeners_see_adds_updates_removes_and_evictions() {
        let node = node("a", 1, 1);
        let events = recorder(&node, None);

        node.put(1, "a".into(), Attributes::new());
        node.put(1, "b".into(), Attributes::new());
        node.put(2, "c".into(), Attributes::new());
        node.put(3, "d".into(), Attributes::new());
        node.remove(&3).unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                (EventKind::Added, 1, 1),
                (EventKind::Updated, 1, 2),
                (EventKind::Added, 2, 1),
                (EventKind::Added, 3, 1),
                (EventKind::Evicted, 1, 2),
                (EventKind::Removed, 3, 2),
            ]
        );
    }

    #[test]
    fn filtered_listener_sees_entries_leaving_the_filter() {
        let node = node("a", 8, 8);
        let events = recorder(&node, Some(Predicate::eq("category", "phone")));

        node.put(1, "pixel".into(), attributes([("category", "phone")]));
        node.put(2, "ipad".into(), attributes([("category", "tablet")]));
        node.put(1, "pixel tablet".into(), attributes([("category", "tablet")]));
        node.remove(&2).unwrap();

        assert_eq!(
            *events.lock(),
            vec![(EventKind::Added, 1, 1), (EventKind::Updated, 1, 2)]
        );
    }

    #[test]
    fn failing_listener_does_not_abort_the_mutation() {
        let node = node("a", 8, 8);
        node.add_entry_listener(
            None,
            false,
            Arc::new(|_: &EntryEvent<u64, String>| -> Result<(), ListenerError> {
                Err("downstream index offline".into())
            }),
        )
        .unwrap();
        let events = recorder(&node, None);

        assert!(matches!(node.put(5, "x".into(), Attributes::new()), WriteOutcome::Applied { .. }));
        assert_eq!(events.lock().len(), 1);
        let failures = node.take_listener_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "5");
        assert_eq!(failures[0].message, "downstream index offline");
    }

    #[test]
    fn stale_writes_are_reported_not_applied() {
        let node = node("a", 8, 8);
        let events = recorder(&node, None);
        node.put_versioned(1, "v5".into(), Attributes::new(), 5);
        assert_eq!(
            node.put_versioned(1, "v3".into(), Attributes::new(), 3),
            WriteOutcome::Stale { current: 5 }
        );
        assert_eq!(node.remove_versioned(&1, 4).unwrap(), RemoveOutcome::Stale { current: 5 });
        assert_eq!(events.lock().len(), 1);
        assert!(matches!(
            node.add_entry_listener(Some(Predicate::And(vec![])), true, Arc::new(
                |_: &EntryEvent<u64, String>| -> Result<(), ListenerError> { Ok(()) }
            )),
            Err(CacheError::InvalidPredicate(_))
        ));
    }

    #[test]
    fn out_of_order_invalidations_keep_the_newest_version() {
        let node = node("a", 8, 8);
        let events = recorder(&node, None);
        let v5 = InvalidationMessage::new("products", 1u64, Operation::Put, 5, "b".into());
        let v3 = InvalidationMessage::new("products", 1u64, Operation::Put, 3, "b".into());

        assert!(node.apply_invalidation(&v5));
        assert!(!node.apply_invalidation(&v3));
        assert!(!node.apply_invalidation(&v5));
        assert_eq!(node.store().version_of(&1), 5);
        assert_eq!(*events.lock(), vec![(EventKind::Updated, 1, 5)]);

        let echo = InvalidationMessage::new("products", 1u64, Operation::Put, 9, "a".into());
        let foreign = InvalidationMessage::new("orders", 1u64, Operation::Put, 9, "b".into());
        assert!(!node.apply_invalidation(&echo));
        assert!(!node.apply_invalidation(&foreign));
        // A later local write continues past the observed version.
        assert_eq!(node.put(1, "x".into(), Attributes::new()), WriteOutcome::Applied { version: 6 });
    }

    #[test]
    fn newer_remote_version_drops_local_copy() {
        let node = node("a", 8, 8);
        node.put(1, "mine".into(), Attributes::new());
        let newer = InvalidationMessage::new("products", 1u64, Operation::Delete, 4, "b".into());
        assert!(node.apply_invalidation(&newer));
        assert!(node.get(&1).unwrap().is_none());
    }

    #[tokio::test]
    async fn mutations_reach_peers_through_the_bus() {
        let bus = InvalidationBus::new(Arc::new(LocalTransport::default()));
        let a = Arc::new(node("a", 8, 8).with_bus(Arc::clone(&bus)));
        let b = Arc::new(node("b", 8, 8).with_bus(Arc::clone(&bus)));
        let _sub_a = a.join().await.unwrap();
        let _sub_b = b.join().await.unwrap();
        let remote = recorder(&b, None);

        a.put(7, "phone".into(), Attributes::new());
        a.put(7, "phone v2".into(), Attributes::new());
        a.remove(&7).unwrap();

        eventually(|| remote.lock().len() == 3).await;
        assert_eq!(
            *remote.lock(),
            vec![
                (EventKind::Updated, 7, 1),
                (EventKind::Updated, 7, 2),
                (EventKind::Removed, 7, 3),
            ]
        );
        assert_eq!(b.store().version_of(&7), 3);
        // Node a ignores the echo of its own messages.
        assert_eq!(a.store().version_of(&7), 3);
    }

    #[test]
    fn demoted_entry_stays_readable_at_capacity_one_with_default_partitions() {
        let node = CacheNode::<u64, String>::new(
            "a",
            NodeConfig {
                hot_capacity: 1,
                cold_capacity: 1,
                ..NodeConfig::for_namespace("products")
            },
        )
        .unwrap();
        node.put(1, "A".into(), Attributes::new());
        node.put(1, "B".into(), Attributes::new());
        node.put(2, "C".into(), Attributes::new());
        assert_eq!(node.store().peek(&1).unwrap().tier, Tier::Cold);

        let entry = node.get(&1).unwrap().unwrap();
        assert_eq!((entry.value.as_str(), entry.version), ("B", 2));
    }

    #[test]
    fn concurrent_writers_deliver_each_keys_events_in_version_order() {
        let node = CacheNode::<u64, String>::new("a", NodeConfig::for_namespace("products")).unwrap();
        let seen: Arc<Mutex<Vec<(u64, u64, Option<String>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        node.add_entry_listener(
            None,
            true,
            Arc::new(move |e: &EntryEvent<u64, String>| -> Result<(), ListenerError> {
                sink.lock()
                    .push((e.key, e.version, e.value.as_ref().map(|v| v.to_string())));
                Ok(())
            }),
        )
        .unwrap();

        let written: Vec<(u64, u64, String)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let node = &node;
                    scope.spawn(move || {
                        (0..100u64)
                            .filter_map(|i| {
                                let key = i % 4;
                                let value = format!("{t}-{i}");
                                let version = node.put(key, value.clone(), Attributes::new()).version()?;
                                Some((key, version, value))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let seen = seen.lock();
        assert_eq!(seen.len(), written.len());
        for key in 0..4u64 {
            let versions: Vec<u64> = seen.iter().filter(|e| e.0 == key).map(|e| e.1).collect();
            assert!(versions.windows(2).all(|w| w[0] < w[1]), "key {key}: {versions:?}");
        }
        for (key, version, value) in &written {
            assert!(seen.contains(&(*key, *version, Some(value.clone()))));
        }
    }

    #[test]
    fn listeners_may_write_to_their_own_node() {
        let node = Arc::new(node("a", 8, 8));
        let weak = Arc::downgrade(&node);
        node.add_entry_listener(
            Some(Predicate::eq("category", "phone")),
            true,
            Arc::new(move |e: &EntryEvent<u64, String>| -> Result<(), ListenerError> {
                if let Some(node) = weak.upgrade() {
                    node.put(e.key + 100, "audit".into(), Attributes::new());
                }
                Ok(())
            }),
        )
        .unwrap();

        node.put(1, "pixel".into(), attributes([("category", "phone")]));
        assert_eq!(node.get(&101).unwrap().unwrap().value.as_str(), "audit");
    }

    #[tokio::test]
    async fn join_requires_a_bus() {
        let node = Arc::new(node("a", 8, 8));
        assert!(matches!(node.join().await, Err(CacheError::InvalidConfig(_))));
    }
}
