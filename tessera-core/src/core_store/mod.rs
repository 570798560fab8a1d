//! Storage collaborator
//!
//! The engine persists through the narrow `Storage` trait: point lookups, ordered
//! prefix scans, atomic batches and a keyed resource lock. `MemoryStore` is the
//! bundled implementation.

pub mod errors;
mod lock_map;
mod memory;

pub use errors::{StoreError, StoreResult};
pub use lock_map::{KeyedGuard, KeyedLock};
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// One mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Apply every op or none of them
    fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// All entries under `prefix`, ascending by key
    fn iterate_by_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Exclusive access to the resource named `id` until the guard drops
    fn lock(&self, id: &[u8]) -> KeyedGuard<'_>;
}

/// bincode-encode a record for storage
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a persisted record. Failures mean the stored bytes are corrupt.
pub fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::Corrupted(format!("{}: {}", String::from_utf8_lossy(key), e)))
}
