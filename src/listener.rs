//! Entry listeners and their isolated, in-order dispatch

use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt::Display,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, error, warn};

use crate::{Attributes, NodeId, Predicate};

/// Identifier returned by listener registration
pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    /// Removed by a client
    Removed,
    /// Dropped from the cold tier for capacity
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    /// Learned from another node's invalidation message
    Remote(NodeId),
}

/// A change to one entry, as seen by listeners
#[derive(Debug)]
pub struct EntryEvent<K, V> {
    pub kind: EventKind,
    pub key: K,
    pub value: Option<Arc<V>>,
    pub old_value: Option<Arc<V>>,
    pub version: u64,
    pub origin: EventOrigin,
}

impl<K: Clone, V> Clone for EntryEvent<K, V> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            key: self.key.clone(),
            value: self.value.clone(),
            old_value: self.old_value.clone(),
            version: self.version,
            origin: self.origin.clone(),
        }
    }
}

impl<K: Clone, V> EntryEvent<K, V> {
    fn without_values(&self) -> Self {
        Self {
            value: None,
            old_value: None,
            ..self.clone()
        }
    }
}

/// Error a listener reports back to the dispatcher
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

pub trait EntryListener<K, V>: Send + Sync {
    fn on_event(&self, event: &EntryEvent<K, V>) -> Result<(), ListenerError>;
}

impl<K, V, F> EntryListener<K, V> for F
where
    F: Fn(&EntryEvent<K, V>) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &EntryEvent<K, V>) -> Result<(), ListenerError> {
        self(event)
    }
}

/// A listener failure captured during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub key: String,
    pub version: u64,
    pub message: String,
}

struct Registration<K, V> {
    id: ListenerId,
    predicate: Option<Predicate>,
    include_value: bool,
    listener: Arc<dyn EntryListener<K, V>>,
}

impl<K, V> Clone for Registration<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            predicate: self.predicate.clone(),
            include_value: self.include_value,
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<K, V> Registration<K, V> {
    /// Filtered listeners see an event if the entry matched before or after.
    fn wants(&self, new: Option<&Attributes>, old: Option<&Attributes>) -> bool {
        match &self.predicate {
            None => true,
            Some(p) => new.is_some_and(|a| p.matches(a)) || old.is_some_and(|a| p.matches(a)),
        }
    }
}

pub(crate) struct ListenerRegistry<K, V> {
    registrations: RwLock<Vec<Registration<K, V>>>,
    next_id: AtomicU64,
    failures: Mutex<VecDeque<ListenerFailure>>,
    failure_capacity: usize,
}

impl<K: Clone + Display, V> ListenerRegistry<K, V> {
    pub(crate) fn new(failure_capacity: usize) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: Mutex::new(VecDeque::new()),
            failure_capacity,
        }
    }

    pub(crate) fn register(
        &self,
        predicate: Option<Predicate>,
        include_value: bool,
        listener: Arc<dyn EntryListener<K, V>>,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.write().push(Registration {
            id,
            predicate,
            include_value,
            listener,
        });
        debug!("Registered entry listener {}", id);
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.read().len()
    }

    /// Call matching listeners in registration order.
    ///
    /// `new`/`old` are the entry's attributes after and before the change.
    /// When neither is known (remote events) only unfiltered listeners run.
    pub(crate) fn dispatch(
        &self,
        event: &EntryEvent<K, V>,
        new: Option<&Attributes>,
        old: Option<&Attributes>,
    ) {
        // Snapshot so listeners may (un)register without deadlocking.
        let registrations: Vec<Registration<K, V>> = self.registrations.read().clone();
        let mut stripped = None;
        for registration in registrations.iter().filter(|r| r.wants(new, old)) {
            let delivered = if registration.include_value {
                event
            } else {
                &*stripped.get_or_insert_with(|| event.without_values())
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                registration.listener.on_event(delivered)
            }));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(
                        "Entry listener {} failed on key {}: {}",
                        registration.id, event.key, e
                    );
                    e.0
                }
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        (*s).to_owned()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_owned()
                    };
                    error!(
                        "Entry listener {} panicked on key {}: {}",
                        registration.id, event.key, message
                    );
                    message
                }
            };
            self.record(ListenerFailure {
                listener: registration.id,
                key: event.key.to_string(),
                version: event.version,
                message,
            });
        }
    }

    fn record(&self, failure: ListenerFailure) {
        if self.failure_capacity == 0 {
            return;
        }
        let mut failures = self.failures.lock();
        if failures.len() == self.failure_capacity {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    pub(crate) fn take_failures(&self) -> Vec<ListenerFailure> {
        self.failures.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes;

    fn listener<F>(f: F) -> Arc<dyn EntryListener<u32, String>>
    where
        F: Fn(&EntryEvent<u32, String>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn event(kind: EventKind, key: u32) -> EntryEvent<u32, String> {
        EntryEvent {
            kind,
            key,
            value: Some(Arc::new("new".into())),
            old_value: None,
            version: 1,
            origin: EventOrigin::Local,
        }
    }

    #[test]
    fn failures_are_isolated_and_reported() {
        let registry = ListenerRegistry::<u32, String>::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry.register(None, true, listener(|_| Err("nope".into())));
        registry.register(None, true, listener(|_| panic!("listener blew up")));
        let sink = Arc::clone(&seen);
        registry.register(
            None,
            true,
            listener(move |e| {
                sink.lock().push(e.key);
                Ok(())
            }),
        );

        registry.dispatch(&event(EventKind::Added, 5), None, None);

        assert_eq!(*seen.lock(), vec![5]);
        let failures = registry.take_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, "nope");
        assert_eq!(failures[1].message, "listener blew up");
        assert_eq!(failures[1].key, "5");
        assert!(registry.take_failures().is_empty());
    }

    #[test]
    fn runs_in_registration_order_and_respects_predicates() {
        let registry = ListenerRegistry::<u32, String>::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            registry.register(
                None,
                false,
                listener(move |e| {
                    assert!(e.value.is_none());
                    order.lock().push(tag);
                    Ok(())
                }),
            );
        }
        let filtered = Arc::clone(&order);
        let id = registry.register(
            Some(Predicate::eq("category", "phone")),
            true,
            listener(move |_| {
                filtered.lock().push("phones");
                Ok(())
            }),
        );

        let tablet = attributes([("category", "tablet")]);
        let phone = attributes([("category", "phone")]);
        registry.dispatch(&event(EventKind::Updated, 1), Some(&tablet), Some(&phone));
        registry.dispatch(&event(EventKind::Added, 2), Some(&tablet), None);
        assert_eq!(*order.lock(), vec!["first", "second", "phones", "first", "second"]);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn failure_ring_is_bounded() {
        let registry = ListenerRegistry::<u32, String>::new(2);
        registry.register(None, true, listener(|_| Err("x".into())));
        for key in 0..5 {
            registry.dispatch(&event(EventKind::Added, key), None, None);
        }
        let keys: Vec<String> = registry.take_failures().into_iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["3", "4"]);
    }
}
