//! Near cache
//!
//! A bounded, TTL-limited local copy of values owned by remote cache nodes.
//! Reads are served locally until a copy expires or an invalidation removes
//! it. Misses go to the owning node through a [`RemoteSource`]; concurrent
//! misses for one key share a single fetch.

use async_trait::async_trait;
use moka::{policy::EvictionPolicy, sync::Cache};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::watch,
    time::{Instant, timeout},
};
use tracing::{debug, error, warn};

use crate::{
    CacheError, CacheKey, Cacheable, InvalidationBus, NearCacheConfig, Subscription,
    UnavailablePolicy, Versioned,
};

/// Where a near cache loads values it does not hold
#[async_trait]
pub trait RemoteSource<K, V>: Send + Sync + 'static {
    /// Current value and version of `key` on its owning node.
    async fn fetch(&self, key: &K) -> Result<Option<Versioned<V>>, CacheError>;
}

/// A locally held copy of a remote value
#[derive(Debug)]
pub struct NearCacheEntry<K, V> {
    pub key: K,
    pub value: Arc<V>,
    pub expires_at: Instant,
    /// Version of the value on the owning node when it was fetched
    pub source_version: u64,
}

/// Result of a near-cache read, telling the caller where the value came from
#[derive(Debug)]
pub enum NearRead<V> {
    /// Served from an unexpired local copy
    Hit(Arc<V>),
    /// Loaded from the owning node
    Fetched(Arc<V>),
    /// The owning node does not hold the key
    NotFound,
    /// The owning node was unreachable; an expired local copy was served
    Expired(Arc<V>),
    /// The owning node was unreachable and nothing could be served
    Unavailable,
}

impl<V> NearRead<V> {
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            NearRead::Hit(v) | NearRead::Fetched(v) | NearRead::Expired(v) => Some(v),
            NearRead::NotFound | NearRead::Unavailable => None,
        }
    }

    pub fn into_value(self) -> Option<Arc<V>> {
        match self {
            NearRead::Hit(v) | NearRead::Fetched(v) | NearRead::Expired(v) => Some(v),
            NearRead::NotFound | NearRead::Unavailable => None,
        }
    }

    /// Whether the owning node could not be reached for this read.
    pub fn is_degraded(&self) -> bool {
        matches!(self, NearRead::Expired(_) | NearRead::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NearCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub fetches: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    fetches: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
enum FetchFailure {
    Unavailable,
    Failed(String),
}

type FetchResult<V> = Result<Option<Versioned<V>>, FetchFailure>;
type InFlightFetch<V> = watch::Receiver<Option<FetchResult<V>>>;
type InFlightMap<K, V> = Arc<Mutex<HashMap<K, InFlightFetch<V>>>>;

/// Guard that clears the in-flight registration even on panic or cancel.
///
/// If dropped before [`InFlightGuard::complete`], waiters are woken with an
/// error.
struct InFlightGuard<K: CacheKey, V: Cacheable> {
    key: K,
    in_flight: InFlightMap<K, V>,
    tx: Option<watch::Sender<Option<FetchResult<V>>>>,
}

impl<K: CacheKey, V: Cacheable> InFlightGuard<K, V> {
    fn complete(mut self, result: FetchResult<V>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<K: CacheKey, V: Cacheable> Drop for InFlightGuard<K, V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(FetchFailure::Failed(
                "Fetch was cancelled or panicked".to_owned(),
            ))));
        }
        self.in_flight.lock().remove(&self.key);
    }
}

/// What [`NearCache::fill`] did with a fetched value
enum Fill {
    Stored,
    /// An unversioned invalidation or a clear happened while the fetch was
    /// in flight; the value is returned but not kept.
    Superseded,
    /// Older than the last versioned invalidation seen for the key
    Stale,
}

enum Role<K: CacheKey, V: Cacheable> {
    Lead(InFlightGuard<K, V>),
    Follow(InFlightFetch<V>),
}

pub struct NearCache<K: CacheKey, V: Cacheable> {
    source: Arc<dyn RemoteSource<K, V>>,
    config: NearCacheConfig,
    entries: Cache<K, Arc<NearCacheEntry<K, V>>>,
    /// Highest invalidated version per key; fills below it are refused
    watermarks: Cache<K, u64>,
    /// Ticks on every unversioned invalidation and clear
    epoch: AtomicU64,
    /// Epoch of the last unversioned invalidation per key
    invalidated_at: Cache<K, u64>,
    cleared_at: AtomicU64,
    fill_lock: Mutex<()>,
    in_flight: InFlightMap<K, V>,
    counters: Counters,
}

impl<K: CacheKey, V: Cacheable> NearCache<K, V> {
    pub fn new(source: Arc<dyn RemoteSource<K, V>>, config: NearCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let entries = Cache::builder()
            .max_capacity(config.max_size)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        let watermarks = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(config.ttl)
            .build();
        let invalidated_at = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(config.ttl.max(config.fetch_timeout))
            .build();
        Ok(Self {
            source,
            config,
            entries,
            watermarks,
            epoch: AtomicU64::new(0),
            invalidated_at,
            cleared_at: AtomicU64::new(0),
            fill_lock: Mutex::new(()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &NearCacheConfig {
        &self.config
    }

    /// Get `key`, from the local copy when it is still fresh.
    pub async fn get(&self, key: &K) -> Result<NearRead<V>, CacheError> {
        let held = self.entries.get(key);
        match &held {
            Some(entry) if entry.expires_at > Instant::now() => {
                Counters::bump(&self.counters.hits);
                debug!("Near cache hit for key: {}", key);
                return Ok(NearRead::Hit(Arc::clone(&entry.value)));
            }
            Some(entry) => {
                Counters::bump(&self.counters.expired);
                debug!(
                    "Near cache copy of key {} (v{}) expired",
                    key, entry.source_version
                );
            }
            None => {
                Counters::bump(&self.counters.misses);
                debug!("Near cache miss for key: {}", key);
            }
        }

        match self.fetch(key).await {
            Ok(Some(versioned)) => Ok(NearRead::Fetched(versioned.value)),
            Ok(None) => Ok(NearRead::NotFound),
            Err(e) if e.is_unavailable() => Ok(self.fallback(key, &e)),
            Err(e) => Err(e),
        }
    }

    /// The local copy of `key` if it has not expired. Never fetches.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Drop the local copy of `key`, whatever its version. A fetch of `key`
    /// already in flight still answers its callers but is not kept.
    pub fn invalidate(&self, key: &K) {
        let _fill = self.fill_lock.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.invalidated_at.insert(key.clone(), epoch);
        self.entries.invalidate(key);
        Counters::bump(&self.counters.invalidations);
        debug!("Near cache invalidated key: {}", key);
    }

    /// Apply an invalidation for `key` at `version`.
    ///
    /// Returns false, changing nothing, when the version is not newer than
    /// what this cache already knows for the key. Otherwise any older local
    /// copy is dropped and later fetches below `version` are refused.
    pub fn invalidate_version(&self, key: &K, version: u64) -> bool {
        let _fill = self.fill_lock.lock();
        let held = self.entries.get(key);
        let known = self
            .watermarks
            .get(key)
            .unwrap_or(0)
            .max(held.as_ref().map_or(0, |entry| entry.source_version));
        if version <= known {
            debug!(
                "Ignoring stale invalidation for key {} (v{} <= v{})",
                key, version, known
            );
            return false;
        }
        self.watermarks.insert(key.clone(), version);
        if held.is_some() {
            self.entries.invalidate(key);
        }
        Counters::bump(&self.counters.invalidations);
        debug!("Near cache invalidated key {} at v{}", key, version);
        true
    }

    pub fn clear(&self) {
        let _fill = self.fill_lock.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.cleared_at.store(epoch, Ordering::SeqCst);
        self.entries.invalidate_all();
    }

    /// Number of locally held entries, expired ones included.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> NearCacheStats {
        NearCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Apply every invalidation published on `namespace`.
    pub async fn attach(
        self: &Arc<Self>,
        bus: &InvalidationBus,
        namespace: &str,
    ) -> Result<Subscription, CacheError> {
        if !self.config.invalidate_on_change {
            return Err(CacheError::InvalidConfig(
                "invalidate_on_change is disabled for this near cache".into(),
            ));
        }
        let near = Arc::downgrade(self);
        bus.subscribe::<K, _>(namespace, move |message| {
            if let Some(near) = near.upgrade() {
                near.invalidate_version(message.key(), message.version());
            }
        })
        .await
    }

    fn fallback(&self, key: &K, error: &CacheError) -> NearRead<V> {
        if self.config.on_unavailable == UnavailablePolicy::ServeExpired
            && let Some(entry) = self.entries.get(key)
        {
            if entry.expires_at > Instant::now() {
                return NearRead::Hit(Arc::clone(&entry.value));
            }
            warn!(
                "{}. Serving expired copy of key {} (v{})",
                error, key, entry.source_version
            );
            return NearRead::Expired(Arc::clone(&entry.value));
        }
        warn!("{}. Reporting key {} as missing", error, key);
        NearRead::Unavailable
    }

    /// Fetch `key` from its owner, joining a fetch already in flight.
    async fn fetch(&self, key: &K) -> Result<Option<Versioned<V>>, CacheError> {
        let role = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(rx) => Role::Follow(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.clone(), rx);
                    Role::Lead(InFlightGuard {
                        key: key.clone(),
                        in_flight: Arc::clone(&self.in_flight),
                        tx: Some(tx),
                    })
                }
            }
        };

        let guard = match role {
            Role::Lead(guard) => guard,
            Role::Follow(mut rx) => {
                debug!("Waiting for in-flight fetch of key: {}", key);
                loop {
                    if let Some(result) = rx.borrow().as_ref() {
                        return result.clone().map_err(|f| self.failure(f));
                    }
                    if rx.changed().await.is_err() {
                        return Err(CacheError::Backend("In-flight fetch was cancelled".into()));
                    }
                }
            }
        };

        let result = self.load(key).await;
        guard.complete(result.clone());
        result.map_err(|f| self.failure(f))
    }

    /// Fetch and store `key`, retrying once if the owner answers with a
    /// version older than the last invalidation seen for the key.
    async fn load(&self, key: &K) -> FetchResult<V> {
        for attempt in 1..=2 {
            Counters::bump(&self.counters.fetches);
            let started = self.epoch.load(Ordering::SeqCst);
            let fetched = match timeout(self.config.fetch_timeout, self.source.fetch(key)).await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) if e.is_unavailable() => {
                    warn!("Owning node unavailable for key {}: {}", key, e);
                    return Err(FetchFailure::Unavailable);
                }
                Ok(Err(e)) => {
                    error!("Remote fetch failed for key {}: {}", key, e);
                    return Err(FetchFailure::Failed(e.to_string()));
                }
                Err(_) => {
                    warn!(
                        "Remote fetch for key {} timed out after {:?}",
                        key, self.config.fetch_timeout
                    );
                    return Err(FetchFailure::Unavailable);
                }
            };
            match self.fill(key, fetched.as_ref(), started) {
                Fill::Stored => return Ok(fetched),
                Fill::Superseded => {
                    debug!("Not keeping copy of key {} invalidated during its fetch", key);
                    return Ok(fetched);
                }
                Fill::Stale => {}
            }
            debug!(
                "Fetched copy of key {} predates its last invalidation (attempt {})",
                key, attempt
            );
        }
        Err(FetchFailure::Unavailable)
    }

    /// Store a fetched value unless an invalidation already superseded it.
    /// `started` is the epoch read before the fetch was sent.
    fn fill(&self, key: &K, fetched: Option<&Versioned<V>>, started: u64) -> Fill {
        let _fill = self.fill_lock.lock();
        let floor = self.watermarks.get(key).unwrap_or(0);
        let dropped_at = self
            .invalidated_at
            .get(key)
            .unwrap_or(0)
            .max(self.cleared_at.load(Ordering::SeqCst));
        match fetched {
            Some(versioned) if versioned.version < floor => Fill::Stale,
            Some(_) if dropped_at > started => Fill::Superseded,
            Some(versioned) => {
                self.entries.insert(
                    key.clone(),
                    Arc::new(NearCacheEntry {
                        key: key.clone(),
                        value: Arc::clone(&versioned.value),
                        expires_at: Instant::now() + self.config.ttl,
                        source_version: versioned.version,
                    }),
                );
                Fill::Stored
            }
            None => {
                self.entries.invalidate(key);
                Fill::Stored
            }
        }
    }

    fn failure(&self, failure: FetchFailure) -> CacheError {
        match failure {
            FetchFailure::Unavailable => CacheError::RemoteUnavailable {
                timeout: self.config.fetch_timeout,
            },
            FetchFailure::Failed(message) => CacheError::Backend(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, CacheNode, LocalTransport, NodeConfig};
    use std::{
        sync::atomic::AtomicBool,
        time::Duration,
    };

    #[derive(Default)]
    struct Origin {
        values: Mutex<HashMap<u64, Versioned<String>>>,
        fetches: AtomicU64,
        delay: Option<Duration>,
        hang: AtomicBool,
    }

    impl Origin {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn set(&self, key: u64, value: &str, version: u64) {
            self.values.lock().insert(
                key,
                Versioned {
                    value: Arc::new(value.to_owned()),
                    version,
                },
            );
        }

        fn fetches(&self) -> u64 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource<u64, String> for Origin {
        async fn fetch(&self, key: &u64) -> Result<Option<Versioned<String>>, CacheError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(self.values.lock().get(key).cloned())
        }
    }

    fn config(ttl_secs: u64) -> NearCacheConfig {
        NearCacheConfig {
            ttl: Duration::from_secs(ttl_secs),
            fetch_timeout: Duration::from_secs(1),
            ..NearCacheConfig::default()
        }
    }

    fn text(read: &NearRead<String>) -> Option<&str> {
        read.value().map(|v| v.as_str())
    }

    #[tokio::test(start_paused = true)]
    async fn serves_locally_until_ttl_expires() {
        let origin = Arc::new(Origin::default());
        origin.set(1, "A", 1);
        let near = NearCache::<u64, String>::new(origin.clone(), config(5)).unwrap();

        assert!(matches!(near.get(&1).await.unwrap(), NearRead::Fetched(_)));
        let again = near.get(&1).await.unwrap();
        assert!(matches!(again, NearRead::Hit(_)));
        assert_eq!(text(&again), Some("A"));
        assert_eq!(origin.fetches(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(near.peek(&1), None);
        assert!(matches!(near.get(&1).await.unwrap(), NearRead::Fetched(_)));
        assert_eq!(origin.fetches(), 2);

        let stats = near.stats();
        assert_eq!((stats.hits, stats.misses, stats.expired, stats.fetches), (1, 1, 1, 2));
        assert!(matches!(near.get(&99).await.unwrap(), NearRead::NotFound));
    }

    #[tokio::test]
    async fn remote_put_invalidates_before_ttl() {
        let bus = InvalidationBus::new(Arc::new(LocalTransport::default()));
        let node = Arc::new(
            CacheNode::<u64, String>::new("a", NodeConfig::for_namespace("products"))
                .unwrap()
                .with_bus(Arc::clone(&bus)),
        );
        let near = Arc::new(NearCache::<u64, String>::new(node.clone(), config(5)).unwrap());
        let _sub = near.attach(&bus, "products").await.unwrap();

        node.put(1, "A".into(), Attributes::new());
        assert_eq!(text(&near.get(&1).await.unwrap()), Some("A"));
        assert_eq!(near.peek(&1).as_deref().map(String::as_str), Some("A"));

        node.put(1, "B".into(), Attributes::new());
        bus.flush().await.unwrap();
        for _ in 0..100 {
            if near.peek(&1).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(near.peek(&1), None);

        let read = near.get(&1).await.unwrap();
        assert!(matches!(read, NearRead::Fetched(_)));
        assert_eq!(text(&read), Some("B"));
    }

    #[tokio::test]
    async fn stale_invalidations_are_ignored() {
        let origin = Arc::new(Origin::default());
        origin.set(1, "v5", 5);
        let near = NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap();
        near.get(&1).await.unwrap();

        assert!(!near.invalidate_version(&1, 3));
        assert!(!near.invalidate_version(&1, 5));
        assert!(near.peek(&1).is_some());

        assert!(near.invalidate_version(&1, 6));
        assert!(near.peek(&1).is_none());
        assert!(!near.invalidate_version(&1, 6));
    }

    #[tokio::test]
    async fn never_fills_below_an_invalidated_version() {
        let origin = Arc::new(Origin::default());
        origin.set(1, "old", 1);
        let near = NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap();

        assert!(near.invalidate_version(&1, 3));
        let read = near.get(&1).await.unwrap();
        assert!(matches!(read, NearRead::Unavailable));
        assert_eq!(origin.fetches(), 2);
        assert!(near.peek(&1).is_none());

        origin.set(1, "new", 3);
        assert_eq!(text(&near.get(&1).await.unwrap()), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_during_a_fetch_keeps_the_result_out() {
        let origin = Arc::new(Origin::slow(Duration::from_millis(50)));
        origin.set(1, "A", 1);
        let near = Arc::new(NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap());

        let leader = tokio::spawn({
            let near = Arc::clone(&near);
            async move { near.get(&1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        near.invalidate(&1);

        let read = leader.await.unwrap().unwrap();
        assert_eq!(text(&read), Some("A"));
        assert_eq!(near.peek(&1), None);

        origin.set(1, "B", 2);
        assert_eq!(text(&near.get(&1).await.unwrap()), Some("B"));
        assert_eq!(origin.fetches(), 2);
        assert_eq!(near.peek(&1).as_deref().map(String::as_str), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_during_a_fetch_keeps_the_result_out() {
        let origin = Arc::new(Origin::slow(Duration::from_millis(50)));
        origin.set(1, "A", 1);
        let near = Arc::new(NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap());

        let leader = tokio::spawn({
            let near = Arc::clone(&near);
            async move { near.get(&1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        near.clear();

        assert_eq!(text(&leader.await.unwrap().unwrap()), Some("A"));
        assert_eq!(near.peek(&1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_owner_falls_back_per_policy() {
        let origin = Arc::new(Origin::default());
        origin.set(1, "A", 1);
        let near = NearCache::<u64, String>::new(
            origin.clone(),
            NearCacheConfig {
                on_unavailable: UnavailablePolicy::ServeExpired,
                ..config(5)
            },
        )
        .unwrap();
        near.get(&1).await.unwrap();

        origin.hang.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        let read = near.get(&1).await.unwrap();
        assert!(matches!(read, NearRead::Expired(_)));
        assert!(read.is_degraded());
        assert_eq!(text(&read), Some("A"));
        assert!(matches!(near.get(&2).await.unwrap(), NearRead::Unavailable));

        let strict = NearCache::<u64, String>::new(origin.clone(), config(5)).unwrap();
        assert!(matches!(strict.get(&1).await.unwrap(), NearRead::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let origin = Arc::new(Origin::slow(Duration::from_millis(50)));
        origin.set(1, "A", 1);
        let near = NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap();

        let reads = futures::future::join_all((0..8).map(|_| near.get(&1))).await;
        for read in &reads {
            assert_eq!(text(read.as_ref().unwrap()), Some("A"));
        }
        assert_eq!(origin.fetches(), 1);
        assert!(near.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_clears_in_flight_state() {
        let origin = Arc::new(Origin::default());
        origin.set(1, "A", 1);
        origin.hang.store(true, Ordering::SeqCst);
        let near = Arc::new(NearCache::<u64, String>::new(origin.clone(), config(60)).unwrap());

        let leader = tokio::spawn({
            let near = Arc::clone(&near);
            async move { near.get(&1).await.map(|r| r.into_value()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(near.in_flight.lock().len(), 1);
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert!(near.in_flight.lock().is_empty());

        origin.hang.store(false, Ordering::SeqCst);
        assert_eq!(text(&near.get(&1).await.unwrap()), Some("A"));
    }

    #[test]
    fn rejects_invalid_config() {
        let origin: Arc<dyn RemoteSource<u64, String>> = Arc::new(Origin::default());
        let config = NearCacheConfig {
            max_size: 0,
            ..NearCacheConfig::default()
        };
        assert!(matches!(
            NearCache::<u64, String>::new(origin, config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn attach_requires_invalidate_on_change() {
        let bus = InvalidationBus::new(Arc::new(LocalTransport::default()));
        let near = Arc::new(
            NearCache::<u64, String>::new(
                Arc::new(Origin::default()),
                NearCacheConfig {
                    invalidate_on_change: false,
                    ..NearCacheConfig::default()
                },
            )
            .unwrap(),
        );
        assert!(matches!(
            near.attach(&bus, "products").await,
            Err(CacheError::InvalidConfig(_))
        ));
    }
}
