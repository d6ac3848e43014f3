//! Versioned invalidation messages exchanged between nodes

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{CacheError, NodeId};

/// Wire schema written by this build. Older schemas are accepted.
pub const MESSAGE_SCHEMA: u16 = 1;

/// Mutation that produced an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Delete,
}

/// Broadcast notice that a key's authoritative value changed.
///
/// Immutable once built. Delivery is at-least-once and unordered across
/// nodes, so consumers must compare `version` against what they have
/// already applied for the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage<K> {
    schema_version: u16,
    namespace: String,
    key: K,
    op: Operation,
    version: u64,
    origin: NodeId,
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema_version: u16,
}

impl<K> InvalidationMessage<K> {
    pub fn new(
        namespace: impl Into<String>,
        key: K,
        op: Operation,
        version: u64,
        origin: NodeId,
    ) -> Self {
        Self {
            schema_version: MESSAGE_SCHEMA,
            namespace: namespace.into(),
            key,
            op,
            version,
            origin,
        }
    }

    pub fn schema_version(&self) -> u16 {
        self.schema_version
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }
}

impl<K: Serialize> InvalidationMessage<K> {
    pub fn encode(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<K: DeserializeOwned> InvalidationMessage<K> {
    /// Decode a payload, refusing schemas newer than this build understands.
    pub fn decode(payload: &str) -> Result<Self, CacheError> {
        let header: SchemaHeader = serde_json::from_str(payload)?;
        if header.schema_version > MESSAGE_SCHEMA {
            return Err(CacheError::UnsupportedSchema {
                found: header.schema_version,
                supported: MESSAGE_SCHEMA,
            });
        }
        Ok(serde_json::from_str(payload)?)
    }
}
