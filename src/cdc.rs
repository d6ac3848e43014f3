//! Change-data-capture invalidation
//!
//! Row changes captured from the database log are turned into invalidation
//! messages on the table's namespace, so every node and near cache drops
//! copies older than the committed row version.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tracing::debug;

use crate::{CacheError, CacheKey, InvalidationBus, InvalidationMessage, NodeId, Operation};

/// Row operation, encoded with the single-letter codes used by log-based
/// capture tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl ChangeOp {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(ChangeOp::Create),
            "u" => Some(ChangeOp::Update),
            "d" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One captured row change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent<K> {
    pub table: String,
    pub op: ChangeOp,
    pub key: K,
    /// Commit version of the row, e.g. its log sequence number
    pub version: u64,
}

impl<K: DeserializeOwned> ChangeEvent<K> {
    pub fn from_json(payload: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Publishes invalidations for captured row changes.
pub struct CdcInvalidator {
    bus: Arc<InvalidationBus>,
    origin: NodeId,
}

impl CdcInvalidator {
    /// `origin` names this capture feed in the messages it publishes.
    pub fn new(bus: Arc<InvalidationBus>, origin: impl Into<NodeId>) -> Self {
        Self {
            bus,
            origin: origin.into(),
        }
    }

    /// Publish an invalidation for `event`. Returns false for inserts, which
    /// cannot have been cached yet.
    pub fn handle<K: CacheKey>(&self, event: &ChangeEvent<K>) -> Result<bool, CacheError> {
        let op = match event.op {
            ChangeOp::Create => {
                debug!("Ignoring insert into '{}' for key {}", event.table, event.key);
                return Ok(false);
            }
            ChangeOp::Update => Operation::Put,
            ChangeOp::Delete => Operation::Delete,
        };
        let message = InvalidationMessage::new(
            &event.table,
            event.key.clone(),
            op,
            event.version,
            self.origin.clone(),
        );
        self.bus.publish(&message)?;
        debug!(
            "Published {:?} invalidation on '{}' for key {} (v{})",
            op, event.table, event.key, event.version
        );
        Ok(true)
    }

    pub fn handle_json<K: CacheKey>(&self, payload: &str) -> Result<bool, CacheError> {
        self.handle(&ChangeEvent::<K>::from_json(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, CacheNode, LocalTransport, NodeConfig};
    use std::time::Duration;

    #[test]
    fn parses_capture_op_codes() {
        assert_eq!(ChangeOp::from_code("u"), Some(ChangeOp::Update));
        assert_eq!(ChangeOp::from_code("d"), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::from_code("r"), None);

        let event = ChangeEvent::<u64>::from_json(
            r#"{"table":"products","op":"d","key":42,"version":9}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ChangeEvent {
                table: "products".into(),
                op: ChangeOp::Delete,
                key: 42,
                version: 9,
            }
        );
        assert!(ChangeEvent::<u64>::from_json(r#"{"table":"p","op":"x","key":1,"version":1}"#).is_err());
    }

    #[tokio::test]
    async fn row_changes_invalidate_cache_nodes() {
        let bus = InvalidationBus::new(Arc::new(LocalTransport::default()));
        let node = Arc::new(
            CacheNode::<u64, String>::new("a", NodeConfig::for_namespace("products"))
                .unwrap()
                .with_bus(Arc::clone(&bus)),
        );
        let _sub = node.join().await.unwrap();
        node.put(1, "cached row".into(), Attributes::new());

        let cdc = CdcInvalidator::new(Arc::clone(&bus), "cdc");
        assert!(!cdc.handle_json::<u64>(r#"{"table":"products","op":"c","key":2,"version":3}"#).unwrap());
        assert!(cdc.handle(&ChangeEvent {
            table: "products".into(),
            op: ChangeOp::Update,
            key: 1u64,
            version: 7,
        })
        .unwrap());
        bus.flush().await.unwrap();

        for _ in 0..100 {
            if node.store().version_of(&1) == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.store().version_of(&1), 7);
        assert!(node.get(&1).unwrap().is_none());
        assert_eq!(node.store().version_of(&2), 0);
    }
}
