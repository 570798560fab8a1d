//! In-memory ordered key-value store
//!
//! Backs tests and ephemeral nodes. Keys iterate in byte order, which the oplog
//! layout relies on for time-ordered scans.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::errors::StoreResult;
use super::lock_map::{KeyedGuard, KeyedLock};
use super::{Storage, WriteOp};

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    locks: KeyedLock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut data = self.write();
        for op in ops {
            match op {
                WriteOp::Put(key, value) => {
                    data.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate_by_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.read();
        let items = data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(items)
    }

    fn lock(&self, id: &[u8]) -> KeyedGuard<'_> {
        self.locks.lock(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_scan_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(b"ol/2", b"two").unwrap();
        store.put(b"ol/1", b"one").unwrap();
        store.put(b"om/1", b"other").unwrap();
        store.put(b"ok", b"before").unwrap();

        let items = store.iterate_by_prefix(b"ol/").unwrap();
        let keys: Vec<_> = items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"ol/1".as_slice(), b"ol/2".as_slice()]);
    }

    #[test]
    fn test_write_batch_applies_all() {
        let store = MemoryStore::new();
        store.put(b"gone", b"x").unwrap();
        store
            .write_batch(vec![
                WriteOp::Put(b"a".to_vec(), b"1".to_vec()),
                WriteOp::Put(b"b".to_vec(), b"2".to_vec()),
                WriteOp::Delete(b"gone".to_vec()),
            ])
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b"gone").unwrap(), None);
    }
}
