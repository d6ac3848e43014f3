//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// Configuration for a [`CacheNode`](crate::CacheNode) and its entry store
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Namespace (map name) this node serves and publishes invalidations on
    pub namespace: String,
    /// Number of independently locked store partitions
    pub partitions: usize,
    /// Maximum number of entries in the hot tier, across all partitions
    pub hot_capacity: usize,
    /// Maximum number of entries in the cold tier, across all partitions
    pub cold_capacity: usize,
    /// Number of listener failures retained for [`take_listener_failures`]
    ///
    /// [`take_listener_failures`]: crate::CacheNode::take_listener_failures
    pub listener_failure_capacity: usize,
    /// Versions remembered for keys that are no longer resident, across all
    /// partitions
    pub tombstone_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            partitions: 16,
            hot_capacity: 10_000,
            cold_capacity: 100_000,
            listener_failure_capacity: 256,
            tombstone_capacity: 100_000,
        }
    }
}

impl NodeConfig {
    /// Configuration for the given namespace with default sizing.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.namespace.is_empty() {
            return Err(CacheError::InvalidConfig("namespace must not be empty".into()));
        }
        if self.partitions == 0 {
            return Err(CacheError::InvalidConfig("partitions must be at least 1".into()));
        }
        if self.hot_capacity == 0 {
            return Err(CacheError::InvalidConfig("hot_capacity must be at least 1".into()));
        }
        if self.cold_capacity == 0 {
            return Err(CacheError::InvalidConfig("cold_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Partitions actually created: never more than either tier capacity,
    /// so every partition gets at least one hot and one cold slot.
    pub(crate) fn effective_partitions(&self) -> usize {
        self.partitions
            .min(self.hot_capacity)
            .min(self.cold_capacity)
            .max(1)
    }

    /// Capacity share of partition `index`; shares sum exactly to `total`.
    pub(crate) fn share(&self, total: usize, index: usize) -> usize {
        let partitions = self.effective_partitions();
        let base = total / partitions;
        let remainder = total % partitions;
        base + usize::from(index < remainder)
    }
}

/// What a near cache returns when the owning node cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnavailablePolicy {
    /// Report the key as missing
    #[default]
    NotFound,
    /// Serve an expired local copy if one is still held, else report missing
    ServeExpired,
}

/// Configuration for a [`NearCache`](crate::NearCache)
#[derive(Debug, Clone)]
pub struct NearCacheConfig {
    /// Maximum number of locally held entries
    pub max_size: u64,
    /// Time-to-live of a locally held entry
    pub ttl: Duration,
    /// Upper bound on a remote fetch
    pub fetch_timeout: Duration,
    /// Fallback when a remote fetch times out
    pub on_unavailable: UnavailablePolicy,
    /// Apply invalidation messages delivered by the bus
    pub invalidate_on_change: bool,
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 5000,
            ttl: Duration::from_secs(300), // 5 minutes
            fetch_timeout: Duration::from_secs(2),
            on_unavailable: UnavailablePolicy::NotFound,
            invalidate_on_change: true,
        }
    }
}

impl NearCacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be non-zero".into()));
        }
        if self.fetch_timeout.is_zero() {
            return Err(CacheError::InvalidConfig("fetch_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_shares_sum_to_total() {
        let config = NodeConfig {
            partitions: 4,
            ..NodeConfig::default()
        };
        let shares: Vec<usize> = (0..4).map(|i| config.share(10, i)).collect();
        assert_eq!(shares, vec![3, 3, 2, 2]);
        assert_eq!((0..4).map(|i| config.share(1, i)).sum::<usize>(), 1);
    }

    #[test]
    fn small_capacities_use_fewer_partitions() {
        let config = NodeConfig {
            hot_capacity: 3,
            cold_capacity: 8,
            ..NodeConfig::default()
        };
        assert_eq!(config.effective_partitions(), 3);
        let hot: Vec<usize> = (0..3).map(|i| config.share(3, i)).collect();
        assert_eq!(hot, vec![1, 1, 1]);
        assert!((0..3).all(|i| config.share(8, i) >= 1));

        assert_eq!(NodeConfig::default().effective_partitions(), 16);
    }

    #[test]
    fn rejects_degenerate_sizing() {
        let config = NodeConfig {
            partitions: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
        let config = NodeConfig {
            cold_capacity: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        let near = NearCacheConfig {
            ttl: Duration::ZERO,
            ..NearCacheConfig::default()
        };
        assert!(near.validate().is_err());
        assert!(NearCacheConfig::default().validate().is_ok());
    }
}
