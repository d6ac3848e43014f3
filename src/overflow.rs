//! Durable overflow for entries evicted from the cold tier

use serde::{Deserialize, Serialize};

use crate::{Attributes, CacheError, StoreError};

/// Schema version written into every [`StoredEntry`]
pub const STORED_ENTRY_SCHEMA: u16 = 1;

/// Persistent store that receives entries pushed out of the cold tier.
///
/// Calls happen while the owning partition is locked, so implementations
/// should be quick or buffer internally. Failures are surfaced, never
/// swallowed: an entry whose write fails stays resident in memory.
pub trait OverflowStore: Send + Sync + 'static {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Serialized form of an entry in the overflow store
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredEntry<V> {
    pub schema_version: u16,
    pub version: u64,
    pub value: V,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema_version: u16,
}

impl<V: Serialize> StoredEntry<V> {
    pub fn encode(value: &V, version: u64, attributes: &Attributes) -> Result<Vec<u8>, CacheError> {
        #[derive(Serialize)]
        struct Borrowed<'a, V> {
            schema_version: u16,
            version: u64,
            value: &'a V,
            attributes: &'a Attributes,
        }

        Ok(serde_json::to_vec(&Borrowed {
            schema_version: STORED_ENTRY_SCHEMA,
            version,
            value,
            attributes,
        })?)
    }
}

impl<V: serde::de::DeserializeOwned> StoredEntry<V> {
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let header: SchemaHeader = serde_json::from_slice(bytes)?;
        if header.schema_version > STORED_ENTRY_SCHEMA {
            return Err(CacheError::UnsupportedSchema {
                found: header.schema_version,
                supported: STORED_ENTRY_SCHEMA,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
