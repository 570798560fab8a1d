//! Per-category oplog store
//!
//! Oplogs persist under `ol/<entity>/<category>/<log id>`, so a prefix scan yields
//! them in LogId (time) order. The category's Merkle tree is kept next to the store
//! and only updated after a batch has been written.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::errors::OplogResult;
use super::merkle::MerkleTree;
use super::oplog::Oplog;
use super::types::{EntityId, ListOrder, LogCategory, LogId, Status};
use crate::core_store::{decode, encode, KeyedGuard, Storage, StoreError, WriteOp};

const OPLOG_PREFIX: &[u8] = b"ol/";
const WINNER_PREFIX: &[u8] = b"ow/";

/// A record to write together with the status it had before, if it existed
#[derive(Debug, Clone)]
pub struct OplogChange {
    pub previous: Option<Status>,
    pub oplog: Oplog,
}

pub struct OplogStore {
    entity_id: EntityId,
    category: LogCategory,
    storage: Arc<dyn Storage>,
    merkle: RwLock<MerkleTree>,
}

impl std::fmt::Debug for OplogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OplogStore")
            .field("entity_id", &self.entity_id)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

fn scoped_prefix(base: &[u8], entity_id: &EntityId, category: LogCategory) -> Vec<u8> {
    let mut key = Vec::with_capacity(base.len() + 20);
    key.extend_from_slice(base);
    key.extend_from_slice(entity_id.as_bytes());
    key.push(b'/');
    key.push(category.tag());
    key.push(b'/');
    key
}

impl OplogStore {
    /// Open the store and rebuild its Merkle tree. Undecodable records are fatal.
    pub fn load(
        entity_id: EntityId,
        category: LogCategory,
        storage: Arc<dyn Storage>,
    ) -> OplogResult<Self> {
        let store = OplogStore {
            entity_id,
            category,
            storage,
            merkle: RwLock::new(MerkleTree::new()),
        };

        let mut tree = MerkleTree::new();
        for oplog in store.scan()? {
            if oplog.entity_id != entity_id || oplog.category() != category {
                return Err(StoreError::Corrupted(format!(
                    "oplog {} stored under the wrong entity or category",
                    oplog.id
                ))
                .into());
            }
            tree.insert(&oplog.id, oplog.status);
        }
        debug!(
            entity = %entity_id,
            category = %category,
            indexed = tree.len(),
            "Loaded oplog store"
        );
        *store.merkle_mut() = tree;
        Ok(store)
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn category(&self) -> LogCategory {
        self.category
    }

    fn key(&self, id: &LogId) -> Vec<u8> {
        let mut key = scoped_prefix(OPLOG_PREFIX, &self.entity_id, self.category);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn winner_key(&self, target: &[u8]) -> Vec<u8> {
        let mut key = scoped_prefix(WINNER_PREFIX, &self.entity_id, self.category);
        key.extend_from_slice(target);
        key
    }

    /// Serialize writers of this category
    pub fn lock(&self) -> KeyedGuard<'_> {
        self.storage
            .lock(&scoped_prefix(OPLOG_PREFIX, &self.entity_id, self.category))
    }

    fn scan(&self) -> OplogResult<Vec<Oplog>> {
        let prefix = scoped_prefix(OPLOG_PREFIX, &self.entity_id, self.category);
        self.storage
            .iterate_by_prefix(&prefix)?
            .iter()
            .map(|(k, v)| decode::<Oplog>(k, v).map_err(Into::into))
            .collect()
    }

    pub fn get(&self, id: &LogId) -> OplogResult<Option<Oplog>> {
        let key = self.key(id);
        match self.storage.get(&key)? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` oplogs from `start` (inclusive) in `order`, optionally of one status
    pub fn get_oplog_list(
        &self,
        start: Option<LogId>,
        limit: usize,
        order: ListOrder,
        status: Option<Status>,
    ) -> OplogResult<Vec<Oplog>> {
        let mut all = self.scan()?;
        if order == ListOrder::Prev {
            all.reverse();
        }
        Ok(all
            .into_iter()
            .filter(|o| match (order, start) {
                (_, None) => true,
                (ListOrder::Next, Some(s)) => o.id >= s,
                (ListOrder::Prev, Some(s)) => o.id <= s,
            })
            .filter(|o| status.map_or(true, |s| o.status == s))
            .take(limit)
            .collect())
    }

    pub fn all(&self) -> OplogResult<Vec<Oplog>> {
        self.scan()
    }

    pub fn by_status(&self, status: Status) -> OplogResult<Vec<Oplog>> {
        self.get_oplog_list(None, usize::MAX, ListOrder::Next, Some(status))
    }

    /// Authoritative oplogs whose hour bucket starts at one of `buckets`
    pub fn in_buckets(&self, buckets: &[u64]) -> OplogResult<Vec<Oplog>> {
        let level = super::merkle::MerkleLevel::Hour;
        Ok(self
            .scan()?
            .into_iter()
            .filter(|o| o.status.is_authoritative())
            .filter(|o| buckets.contains(&level.bucket_start(o.id.timestamp().as_micros())))
            .collect())
    }

    /// Current winner among the oplogs racing for `target`
    pub fn winner(&self, target: &[u8]) -> OplogResult<Option<LogId>> {
        let key = self.winner_key(target);
        match self.storage.get(&key)? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_winner(&self, target: &[u8], id: &LogId) -> OplogResult<WriteOp> {
        Ok(WriteOp::Put(self.winner_key(target), encode(id)?))
    }

    /// Write the changed oplogs and any extra ops as one batch, then index them
    pub fn commit(&self, changes: &[OplogChange], extra: Vec<WriteOp>) -> OplogResult<()> {
        if changes.is_empty() && extra.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(changes.len() + extra.len());
        for change in changes {
            ops.push(WriteOp::Put(self.key(&change.oplog.id), encode(&change.oplog)?));
        }
        ops.extend(extra);
        self.storage.write_batch(ops)?;

        let mut tree = self.merkle_mut();
        for change in changes {
            tree.update(&change.oplog.id, change.previous, change.oplog.status);
        }
        Ok(())
    }

    pub fn merkle(&self) -> RwLockReadGuard<'_, MerkleTree> {
        self.merkle.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn merkle_mut(&self) -> RwLockWriteGuard<'_, MerkleTree> {
        self.merkle.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::MyIdentity;
    use crate::core_oplog::oplog::OpKind;
    use crate::core_oplog::types::{ObjectId, Timestamp};
    use crate::core_store::MemoryStore;

    fn object_log(me: &MyIdentity, entity: EntityId, secs: u64, status: Status) -> Oplog {
        let mut log = Oplog::new(
            entity,
            OpKind::CreateObject {
                object_id: ObjectId::new(),
                data: vec![secs as u8],
            },
            me.user_id(),
            Timestamp::from_secs(secs),
        );
        log.status = status;
        log
    }

    #[test]
    fn test_commit_and_list() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let me = MyIdentity::generate();
        let entity = EntityId::new();
        let store = OplogStore::load(entity, LogCategory::Object, storage).unwrap();

        let changes: Vec<OplogChange> = (1..=5)
            .map(|i| OplogChange {
                previous: None,
                oplog: object_log(&me, entity, i * 100, if i % 2 == 0 { Status::Pending } else { Status::Alive }),
            })
            .collect();
        store.commit(&changes, Vec::new()).unwrap();

        let all = store.get_oplog_list(None, 10, ListOrder::Next, None).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let alive = store.get_oplog_list(None, 10, ListOrder::Next, Some(Status::Alive)).unwrap();
        assert_eq!(alive.len(), 3);
        assert_eq!(store.merkle().len(), 3);

        let start = all[2].id;
        let prev = store.get_oplog_list(Some(start), 2, ListOrder::Prev, None).unwrap();
        assert_eq!(prev.iter().map(|o| o.id).collect::<Vec<_>>(), vec![all[2].id, all[1].id]);
    }

    #[test]
    fn test_reload_rebuilds_merkle() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let me = MyIdentity::generate();
        let entity = EntityId::new();
        let store = OplogStore::load(entity, LogCategory::Object, storage.clone()).unwrap();
        let changes = vec![
            OplogChange { previous: None, oplog: object_log(&me, entity, 10, Status::Alive) },
            OplogChange { previous: None, oplog: object_log(&me, entity, 20, Status::Deleted) },
        ];
        store.commit(&changes, Vec::new()).unwrap();
        let root = store.merkle().root();

        let reloaded = OplogStore::load(entity, LogCategory::Object, storage).unwrap();
        assert_eq!(reloaded.merkle().root(), root);
    }

    #[test]
    fn test_corrupt_record_is_fatal() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let entity = EntityId::new();
        let store = OplogStore::load(entity, LogCategory::Object, storage.clone()).unwrap();
        let key = store.key(&LogId::new(Timestamp::from_secs(1)));
        storage.put(&key, b"\xff\xff garbage").unwrap();

        let err = OplogStore::load(entity, LogCategory::Object, storage).unwrap_err();
        assert!(matches!(
            err,
            crate::core_oplog::OplogError::Store(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn test_in_buckets_only_authoritative() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let me = MyIdentity::generate();
        let entity = EntityId::new();
        let store = OplogStore::load(entity, LogCategory::Object, storage).unwrap();
        let changes = vec![
            OplogChange { previous: None, oplog: object_log(&me, entity, 10, Status::Alive) },
            OplogChange { previous: None, oplog: object_log(&me, entity, 20, Status::Pending) },
            OplogChange { previous: None, oplog: object_log(&me, entity, 7_200, Status::Alive) },
        ];
        store.commit(&changes, Vec::new()).unwrap();

        let first_hour = store.in_buckets(&[0]).unwrap();
        assert_eq!(first_hour.len(), 1);
    }
}
