//! gridcache - Embeddable tiered key/value cache for clusters
//!
//! This library provides the authoritative and client-side halves of a
//! distributed cache:
//! - Cache nodes: partitioned, two-tier (hot/cold) LRU entry stores with
//!   secondary attribute indexes and predicate scans
//! - Near caches: bounded, TTL-limited local copies in front of remote nodes
//! - An invalidation bus: versioned, at-least-once change notices fanned out
//!   over a pluggable cluster transport (in-process or Redis pub/sub)
//!
//! The cache supports:
//! - Entry listeners with isolated failures and in-order dispatch
//! - Out-of-order invalidation handling through per-key versions
//! - Optional durable overflow for entries evicted from the cold tier
//! - Change-data-capture invalidation and consistent-hash key routing

mod bus;
mod cdc;
mod config;
mod entry;
mod error;
mod index;
mod listener;
mod message;
mod near;
mod node;
mod overflow;
mod partition;
mod predicate;
mod redis_transport;
mod routing;
mod store;
mod transport;

#[cfg(feature = "python")]
mod python;

pub use bus::{DEFAULT_PUBLISH_QUEUE, InvalidationBus, Subscription};
pub use cdc::{CdcInvalidator, ChangeEvent, ChangeOp};
pub use config::{NearCacheConfig, NodeConfig, UnavailablePolicy};
pub use entry::{
    AttrValue, Attributes, CacheKey, Cacheable, Entry, NodeId, Tier, Versioned, attributes,
};
pub use error::{CacheError, StoreError};
pub use listener::{
    EntryEvent, EntryListener, EventKind, EventOrigin, ListenerError, ListenerFailure, ListenerId,
};
pub use message::{InvalidationMessage, MESSAGE_SCHEMA, Operation};
pub use near::{NearCache, NearCacheEntry, NearCacheStats, NearRead, RemoteSource};
pub use node::CacheNode;
pub use overflow::{OverflowStore, STORED_ENTRY_SCHEMA, StoredEntry};
pub use predicate::{CompareOp, Predicate};
pub use redis_transport::{CHANNEL_PREFIX, RedisTransport, channel_for};
pub use routing::{DEFAULT_VIRTUAL_NODES, HashRing, RoutedSource};
pub use store::{
    EntryStore, Mutation, Read, Removal, RemoveOutcome, Scan, StoreStats, WriteOutcome,
};
pub use transport::{ClusterTransport, LocalTransport, MessageStream};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

#[cfg(feature = "python")]
#[pyo3::pymodule]
fn gridcache(m: &pyo3::Bound<'_, pyo3::types::PyModule>) -> pyo3::PyResult<()> {
    python::register(m)
}
