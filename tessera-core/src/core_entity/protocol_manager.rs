//! Entity protocol manager
//!
//! Lock order: a category's keyed store lock is taken before `record`, `peers`
//! or `keys`. The master store is only read while another category is locked.
//! Methods here never touch the network; they return the sync messages the
//! router should send.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::consensus::{ApproveJoin, MasterSet};
use super::errors::{EntityError, EntityResult};
use super::keys::{KeyInfo, KeyKind};
use super::traits::{Entity, PeerType, ProtocolManager};
use super::{EntityInfo, EntityRecord, EntityStatus, EntityType, Object};
use crate::config::Config;
use crate::core_identity::{MyIdentity, PeerId, UserId};
use crate::core_oplog::{
    advance_status, chunk_oplogs, respond, start_round, wins, EntityId, ListOrder,
    LogCategory, LogId, MergeOutcome, MerkleLevel, MerkleNode, ObjectId, OpKind, Oplog,
    OplogChange, OplogError, OplogStore, SignInfo, Status, SyncMessage, SyncStep, Timestamp,
};
use crate::core_store::{decode, encode, Storage, WriteOp};
use crate::metrics;

const ENTITY_PREFIX: &[u8] = b"en/";
const OBJECT_PREFIX: &[u8] = b"ob/";
const OP_KEY_PREFIX: &[u8] = b"ky/";
const JOIN_KEY_PREFIX: &[u8] = b"jk/";
const SEEN_PREFIX: &[u8] = b"meta/oplog-seen/";

/// Settings every protocol manager shares
#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub master_threshold: usize,
    pub op_key_ttl: Duration,
    pub batch_size: usize,
}

impl From<&Config> for EntityConfig {
    fn from(config: &Config) -> Self {
        EntityConfig {
            master_threshold: config.consensus.master_threshold,
            op_key_ttl: config.handshake.op_key_ttl,
            batch_size: config.sync.batch_size,
        }
    }
}

impl Default for EntityConfig {
    fn default() -> Self {
        EntityConfig::from(&Config::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct RegisteredPeer {
    user_id: UserId,
    peer_type: PeerType,
}

#[derive(Default)]
struct EntityKeys {
    /// Oldest first
    op_keys: Vec<KeyInfo>,
    join_key: Option<KeyInfo>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn scoped_key(prefix: &[u8], entity: &EntityId, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 17 + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(entity.as_bytes());
    if !suffix.is_empty() {
        key.push(b'/');
        key.extend_from_slice(suffix);
    }
    key
}

pub struct EntityProtocolManager {
    me: Arc<MyIdentity>,
    storage: Arc<dyn Storage>,
    config: EntityConfig,
    record: RwLock<EntityRecord>,
    /// Indexed by `LogCategory as usize`
    stores: [OplogStore; 4],
    peers: RwLock<HashMap<PeerId, RegisteredPeer>>,
    keys: RwLock<EntityKeys>,
}

impl std::fmt::Debug for EntityProtocolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityProtocolManager")
            .field("record", &*read(&self.record))
            .finish_non_exhaustive()
    }
}

impl EntityProtocolManager {
    fn open(
        me: Arc<MyIdentity>,
        storage: Arc<dyn Storage>,
        config: EntityConfig,
        record: EntityRecord,
    ) -> EntityResult<Self> {
        let id = record.id;
        let stores = [
            OplogStore::load(id, LogCategory::Master, storage.clone())?,
            OplogStore::load(id, LogCategory::Member, storage.clone())?,
            OplogStore::load(id, LogCategory::OpKey, storage.clone())?,
            OplogStore::load(id, LogCategory::Object, storage.clone())?,
        ];
        Ok(EntityProtocolManager {
            me,
            storage,
            config,
            record: RwLock::new(record),
            stores,
            peers: RwLock::new(HashMap::new()),
            keys: RwLock::new(EntityKeys::default()),
        })
    }

    /// Create a new entity with ourselves as creator and first master
    pub fn create(
        me: Arc<MyIdentity>,
        storage: Arc<dyn Storage>,
        config: EntityConfig,
        entity_type: EntityType,
    ) -> EntityResult<Self> {
        let record = EntityRecord {
            id: EntityId::new(),
            entity_type,
            status: EntityStatus::Init,
            creator_id: me.user_id(),
            update_ts: Timestamp::now(),
            log_id: None,
        };
        let pm = Self::open(me.clone(), storage, config, record)?;
        pm.persist_record()?;

        pm.append_local(OpKind::AddMaster {
            user_id: me.user_id(),
            public_key: me.user_public_key(),
        })?;
        pm.rotate_op_key()?;
        pm.set_join_key(KeyInfo::generate(KeyKind::Join, None))?;

        info!(entity = %pm.id(), kind = %entity_type, "Created entity");
        Ok(pm)
    }

    /// Load a persisted entity. Undecodable records abort with `Corrupted`.
    pub fn load(
        me: Arc<MyIdentity>,
        storage: Arc<dyn Storage>,
        config: EntityConfig,
        id: EntityId,
    ) -> EntityResult<Self> {
        let key = scoped_key(ENTITY_PREFIX, &id, &[]);
        let bytes = storage.get(&key)?.ok_or(EntityError::NotFound(id))?;
        let record: EntityRecord = decode(&key, &bytes)?;
        let pm = Self::open(me, storage, config, record)?;
        pm.load_keys()?;
        Ok(pm)
    }

    /// Bootstrap a local replica from an approval bundle
    pub fn from_join(
        me: Arc<MyIdentity>,
        storage: Arc<dyn Storage>,
        config: EntityConfig,
        bundle: ApproveJoin,
    ) -> EntityResult<Self> {
        let id = bundle.record.id;
        let foreign = bundle
            .master_logs
            .iter()
            .chain(&bundle.member_logs)
            .chain(&bundle.op_key_logs)
            .any(|o| o.entity_id != id);
        if foreign {
            return Err(EntityError::InvalidBundle(
                "oplog for another entity".to_string(),
            ));
        }

        let mut record = bundle.record.clone();
        record.status = EntityStatus::Pending;
        let pm = Self::open(me, storage, config, record)?;
        pm.persist_record()?;

        let mut outcome = pm.merge_oplogs(bundle.master_logs)?;
        outcome.extend(pm.merge_oplogs(bundle.member_logs)?);
        outcome.extend(pm.merge_oplogs(bundle.op_key_logs)?);

        if let Some(op_key) = bundle.op_key {
            pm.install_op_keys(vec![op_key])?;
        }
        if let Some(join_key) = bundle.join_key {
            pm.set_join_key(join_key)?;
        }

        info!(
            entity = %id,
            applied = outcome.applied.len(),
            pending = outcome.pending.len(),
            status = ?pm.status(),
            "Imported entity from join approval"
        );
        Ok(pm)
    }

    /// Ids of all entities persisted in `storage`
    pub fn list_persisted(storage: &dyn Storage) -> EntityResult<Vec<EntityId>> {
        storage
            .iterate_by_prefix(ENTITY_PREFIX)?
            .into_iter()
            .map(|(k, v)| Ok(decode::<EntityRecord>(&k, &v)?.id))
            .collect()
    }

    pub fn status(&self) -> EntityStatus {
        read(&self.record).status
    }

    pub fn record(&self) -> EntityRecord {
        read(&self.record).clone()
    }

    fn store(&self, category: LogCategory) -> &OplogStore {
        &self.stores[category as usize]
    }

    fn persist_record(&self) -> EntityResult<()> {
        let record = self.record();
        let key = scoped_key(ENTITY_PREFIX, &record.id, &[]);
        self.storage.put(&key, &encode(&record)?)?;
        Ok(())
    }

    // ---- keys ----

    fn load_keys(&self) -> EntityResult<()> {
        let id = self.id();
        let mut op_keys = Vec::new();
        for (k, v) in self
            .storage
            .iterate_by_prefix(&scoped_key(OP_KEY_PREFIX, &id, &[]))?
        {
            op_keys.push(decode::<KeyInfo>(&k, &v)?);
        }
        op_keys.sort_by_key(|k| k.create_ts);

        let join_key_key = scoped_key(JOIN_KEY_PREFIX, &id, &[]);
        let join_key = match self.storage.get(&join_key_key)? {
            Some(bytes) => Some(decode::<KeyInfo>(&join_key_key, &bytes)?),
            None => None,
        };

        let mut keys = write(&self.keys);
        keys.op_keys = op_keys;
        keys.join_key = join_key;
        Ok(())
    }

    pub fn op_keys(&self) -> Vec<KeyInfo> {
        read(&self.keys).op_keys.clone()
    }

    /// Newest op-key, used for outgoing traffic
    pub fn current_op_key(&self) -> Option<KeyInfo> {
        read(&self.keys).op_keys.last().cloned()
    }

    pub fn join_key(&self) -> Option<KeyInfo> {
        read(&self.keys).join_key.clone()
    }

    pub fn set_join_key(&self, key: KeyInfo) -> EntityResult<()> {
        let storage_key = scoped_key(JOIN_KEY_PREFIX, &self.id(), &[]);
        self.storage.put(&storage_key, &encode(&key)?)?;
        write(&self.keys).join_key = Some(key);
        Ok(())
    }

    /// Store op-keys received from a master or member. Returns how many were new.
    pub fn install_op_keys(&self, incoming: Vec<KeyInfo>) -> EntityResult<usize> {
        let id = self.id();
        let mut keys = write(&self.keys);
        let mut added = 0;
        for key in incoming {
            if key.kind != KeyKind::Op || keys.op_keys.iter().any(|k| k.key_id == key.key_id) {
                continue;
            }
            let storage_key = scoped_key(OP_KEY_PREFIX, &id, key.key_id.as_bytes());
            self.storage.put(&storage_key, &encode(&key)?)?;
            keys.op_keys.push(key);
            added += 1;
        }
        keys.op_keys.sort_by_key(|k| k.create_ts);
        Ok(added)
    }

    /// Drop expired op-keys, always keeping the newest. Returns the dropped keys.
    pub fn expire_op_keys(&self, now: Timestamp) -> EntityResult<Vec<KeyInfo>> {
        let id = self.id();
        let mut keys = write(&self.keys);
        let Some(newest) = keys.op_keys.last().map(|k| k.key_id) else {
            return Ok(Vec::new());
        };
        let (expired, kept): (Vec<KeyInfo>, Vec<KeyInfo>) = keys
            .op_keys
            .drain(..)
            .partition(|k| k.key_id != newest && k.is_expired(now));
        keys.op_keys = kept;
        for key in &expired {
            self.storage
                .delete(&scoped_key(OP_KEY_PREFIX, &id, key.key_id.as_bytes()))?;
        }
        Ok(expired)
    }

    /// Create a fresh op-key and announce it through an op-key oplog
    pub fn rotate_op_key(&self) -> EntityResult<KeyInfo> {
        self.require_master()?;
        let key = KeyInfo::generate(KeyKind::Op, Some(self.config.op_key_ttl));
        self.install_op_keys(vec![key.clone()])?;
        self.append_local(OpKind::CreateOpKey {
            key_id: key.key_id,
            expire_ts: key.expire_ts,
        })?;
        debug!(entity = %self.id(), key = %key.key_id, "Rotated op-key");
        Ok(key)
    }

    // ---- consensus ----

    pub fn master_set(&self) -> EntityResult<MasterSet> {
        let creator = read(&self.record).creator_id;
        Ok(MasterSet::compute(
            creator,
            &self.store(LogCategory::Master).all()?,
            self.config.master_threshold,
        ))
    }

    /// `(master log id, distinct approved signers, threshold met)` for a set of master signs
    pub fn is_valid_internal_oplog(
        &self,
        signs: &[SignInfo],
    ) -> EntityResult<(Option<LogId>, usize, bool)> {
        Ok(self.master_set()?.is_valid_internal_oplog(signs))
    }

    fn require_master(&self) -> EntityResult<MasterSet> {
        let masters = self.master_set()?;
        if !masters.is_master(&self.me.user_id()) {
            return Err(EntityError::NotMaster(self.me.user_id()));
        }
        Ok(masters)
    }

    fn require_open(&self) -> EntityResult<()> {
        if self.status() == EntityStatus::Deleted {
            return Err(EntityError::Deleted(self.id()));
        }
        Ok(())
    }

    /// Add our master signature to an oplog
    pub fn master_sign(&self, oplog: &mut Oplog) -> EntityResult<bool> {
        let masters = self.require_master()?;
        let master_log_id = masters
            .approving_log(&self.me.user_id())
            .ok_or(EntityError::NotMaster(self.me.user_id()))?;
        Ok(oplog.add_master_sign(self.me.user_key(), master_log_id)?)
    }

    pub fn add_master(&self, user_id: UserId, public_key: [u8; 32]) -> EntityResult<Oplog> {
        self.require_open()?;
        self.require_master()?;
        self.append_local(OpKind::AddMaster { user_id, public_key })
    }

    pub fn revoke_master(&self, user_id: UserId) -> EntityResult<Oplog> {
        self.require_open()?;
        let masters = self.require_master()?;
        let target = masters
            .approving_log(&user_id)
            .ok_or(EntityError::NotMaster(user_id))?;
        self.append_local(OpKind::RevokeMaster { user_id, target })
    }

    pub fn add_member(&self, user_id: UserId, public_key: [u8; 32]) -> EntityResult<Oplog> {
        self.require_open()?;
        self.require_master()?;
        self.append_local(OpKind::AddMember { user_id, public_key })
    }

    pub fn remove_member(&self, user_id: UserId) -> EntityResult<Oplog> {
        self.require_open()?;
        self.require_master()?;
        if !self.is_member(&user_id) {
            return Err(EntityError::NotMember(user_id));
        }
        self.append_local(OpKind::RemoveMember { user_id })
    }

    pub fn delete_entity(&self) -> EntityResult<Oplog> {
        self.require_open()?;
        self.require_master()?;
        self.append_local(OpKind::DeleteEntity)
    }

    /// Admit a user and bundle what it needs to bootstrap its replica
    pub fn approve_join(&self, user_id: UserId, public_key: [u8; 32]) -> EntityResult<ApproveJoin> {
        self.require_open()?;
        self.require_master()?;
        if !self.is_member(&user_id) {
            self.add_member(user_id, public_key)?;
        }

        let authoritative = |category: LogCategory| -> EntityResult<Vec<Oplog>> {
            Ok(self
                .store(category)
                .all()?
                .into_iter()
                .filter(|o| o.status.is_authoritative())
                .collect())
        };
        let master_logs: Vec<Oplog> = self
            .store(LogCategory::Master)
            .all()?
            .into_iter()
            .filter(|o| o.status != Status::Failed)
            .collect();

        Ok(ApproveJoin {
            record: self.record(),
            master_logs,
            member_logs: authoritative(LogCategory::Member)?,
            op_key_logs: authoritative(LogCategory::OpKey)?,
            op_key: self.current_op_key(),
            join_key: self.join_key(),
        })
    }

    /// Winning member-oplog concerning `user`
    pub fn check_member(&self, user: &UserId) -> EntityResult<Option<Oplog>> {
        let store = self.store(LogCategory::Member);
        match store.winner(user.as_bytes())? {
            Some(id) => Ok(store.get(&id)?),
            None => Ok(None),
        }
    }

    fn member_oplog_kind(&self, user: &UserId) -> Option<bool> {
        match self.check_member(user) {
            Ok(Some(oplog)) => Some(matches!(oplog.op, OpKind::AddMember { .. })),
            Ok(None) => None,
            Err(e) => {
                warn!(entity = %self.id(), error = %e, "Failed to read member oplog");
                None
            }
        }
    }

    // ---- objects ----

    /// Create an entity-owned object. The oplog is signed and stored with the
    /// object in one batch; broadcasting is left to the sync timers.
    pub fn create_object(&self, data: Vec<u8>) -> EntityResult<Object> {
        self.require_open()?;
        let object_id = ObjectId::new();
        self.append_local(OpKind::CreateObject { object_id, data })?;
        self.get_object(&object_id)?
            .ok_or(EntityError::ObjectNotFound(object_id))
    }

    pub fn update_object(&self, object_id: ObjectId, data: Vec<u8>) -> EntityResult<Object> {
        self.require_open()?;
        if self.get_object(&object_id)?.is_none() {
            return Err(EntityError::ObjectNotFound(object_id));
        }
        self.append_local(OpKind::UpdateObject { object_id, data })?;
        self.get_object(&object_id)?
            .ok_or(EntityError::ObjectNotFound(object_id))
    }

    pub fn delete_object(&self, object_id: ObjectId) -> EntityResult<Oplog> {
        self.require_open()?;
        if self.get_object(&object_id)?.is_none() {
            return Err(EntityError::ObjectNotFound(object_id));
        }
        self.append_local(OpKind::DeleteObject { object_id })
    }

    fn object_key(&self, object_id: &ObjectId) -> Vec<u8> {
        scoped_key(OBJECT_PREFIX, &self.id(), object_id.as_bytes())
    }

    /// Live object, `None` if unknown or deleted
    pub fn get_object(&self, object_id: &ObjectId) -> EntityResult<Option<Object>> {
        let key = self.object_key(object_id);
        match self.storage.get(&key)? {
            Some(bytes) => {
                let object: Object = decode(&key, &bytes)?;
                Ok((!object.deleted).then_some(object))
            }
            None => Ok(None),
        }
    }

    pub fn objects(&self) -> EntityResult<Vec<Object>> {
        let prefix = scoped_key(OBJECT_PREFIX, &self.id(), &[]);
        let mut objects = Vec::new();
        for (k, v) in self.storage.iterate_by_prefix(&prefix)? {
            let object: Object = decode(&k, &v)?;
            if !object.deleted {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    fn object_write(&self, oplog: &Oplog) -> EntityResult<Option<WriteOp>> {
        let (object_id, data, deleted) = match &oplog.op {
            OpKind::CreateObject { object_id, data } | OpKind::UpdateObject { object_id, data } => {
                (*object_id, data.clone(), false)
            }
            OpKind::DeleteObject { object_id } => (*object_id, Vec::new(), true),
            _ => return Ok(None),
        };
        let object = Object {
            id: object_id,
            entity_id: oplog.entity_id,
            data,
            creator_id: oplog.creator_id,
            update_ts: oplog.update_ts,
            log_id: oplog.id,
            deleted,
        };
        Ok(Some(WriteOp::Put(self.object_key(&object_id), encode(&object)?)))
    }

    // ---- seen markers ----

    fn seen_key(&self, category: LogCategory) -> Vec<u8> {
        scoped_key(SEEN_PREFIX, &self.id(), category.as_str().as_bytes())
    }

    pub fn mark_oplog_seen(&self, category: LogCategory) -> EntityResult<Timestamp> {
        let now = Timestamp::now();
        self.storage.put(&self.seen_key(category), &encode(&now)?)?;
        Ok(now)
    }

    /// Last time the category was marked seen, zero if never
    pub fn oplog_seen(&self, category: LogCategory) -> EntityResult<Timestamp> {
        let key = self.seen_key(category);
        match self.storage.get(&key)? {
            Some(bytes) => Ok(decode(&key, &bytes)?),
            None => Ok(Timestamp::ZERO),
        }
    }

    // ---- oplog queries ----

    pub fn get_oplog_list(
        &self,
        category: LogCategory,
        start: Option<LogId>,
        limit: usize,
        order: ListOrder,
        status: Option<Status>,
    ) -> EntityResult<Vec<Oplog>> {
        Ok(self
            .store(category)
            .get_oplog_list(start, limit, order, status)?)
    }

    pub fn get_oplog(&self, category: LogCategory, id: &LogId) -> EntityResult<Option<Oplog>> {
        Ok(self.store(category).get(id)?)
    }

    pub fn get_merkle_node_list(
        &self,
        category: LogCategory,
        level: MerkleLevel,
        start_key: Option<u64>,
        limit: usize,
        order: ListOrder,
    ) -> Vec<MerkleNode> {
        self.store(category)
            .merkle()
            .get_merkle_node_list(level, start_key, limit, order)
    }

    pub fn merkle_root(&self, category: LogCategory) -> MerkleNode {
        self.store(category).merkle().root()
    }

    // ---- merge ----

    /// Sign and apply a locally originated op
    fn append_local(&self, op: OpKind) -> EntityResult<Oplog> {
        let masters = self.master_set()?;
        let my_id = self.me.user_id();
        let mut oplog = Oplog::new(self.id(), op, my_id, Timestamp::now());
        oplog.sign_creator(self.me.user_key())?;
        oplog.sign_internal(self.me.node_key(), my_id)?;
        if let Some(master_log_id) = masters.approving_log(&my_id) {
            oplog.add_master_sign(self.me.user_key(), master_log_id)?;
        }

        let id = oplog.id;
        let category = oplog.category();
        self.merge_category(category, vec![oplog], true)?;
        self.store(category)
            .get(&id)?
            .ok_or_else(|| OplogError::NotFound(id).into())
    }

    /// Merge a batch received from a peer. Idempotent; statuses claimed by the
    /// sender are ignored and derived locally.
    pub fn merge_oplogs(&self, batch: Vec<Oplog>) -> EntityResult<MergeOutcome> {
        let id = self.id();
        let mut outcome = MergeOutcome::default();
        let mut by_category: BTreeMap<LogCategory, Vec<Oplog>> = BTreeMap::new();
        for oplog in batch {
            if oplog.entity_id != id {
                outcome.failed.push(oplog.id);
                continue;
            }
            by_category.entry(oplog.category()).or_default().push(oplog);
        }
        // master information first, later categories validate against it
        for (category, oplogs) in by_category {
            outcome.extend(self.merge_category(category, oplogs, false)?);
        }

        metrics::oplogs_merged("applied", outcome.applied.len());
        metrics::oplogs_merged("conflict", outcome.conflicts.len());
        metrics::oplogs_merged("pending", outcome.pending.len());
        metrics::oplogs_merged("failed", outcome.failed.len());
        Ok(outcome)
    }

    fn merge_category(
        &self,
        category: LogCategory,
        mut incoming: Vec<Oplog>,
        local: bool,
    ) -> EntityResult<MergeOutcome> {
        incoming.sort_by_key(|o| o.id);
        let store = self.store(category);
        let _guard = store.lock();

        let (changes, extra, outcome, masters) = if category == LogCategory::Master {
            self.merge_master_locked(store, incoming, local)?
        } else {
            let masters = self.master_set()?;
            let (changes, extra, outcome) =
                self.merge_internal_locked(store, &masters, incoming, local)?;
            (changes, extra, outcome, masters)
        };

        store.commit(&changes, extra)?;
        if !outcome.is_empty() {
            debug!(
                entity = %self.id(),
                category = %category,
                applied = outcome.applied.len(),
                conflicts = outcome.conflicts.len(),
                pending = outcome.pending.len(),
                failed = outcome.failed.len(),
                "Merged oplogs"
            );
        }
        self.refresh_record(&masters, &changes)?;
        Ok(outcome)
    }

    /// Member, op-key and object categories
    fn merge_internal_locked(
        &self,
        store: &OplogStore,
        masters: &MasterSet,
        incoming: Vec<Oplog>,
        local: bool,
    ) -> EntityResult<(Vec<OplogChange>, Vec<WriteOp>, MergeOutcome)> {
        let mut changes: Vec<OplogChange> = Vec::new();
        let mut index: HashMap<LogId, usize> = HashMap::new();
        let mut extra = Vec::new();
        let mut winners: HashMap<Vec<u8>, Oplog> = HashMap::new();
        let mut outcome = MergeOutcome::default();

        for log in incoming {
            if log.category() != store.category() {
                outcome.failed.push(log.id);
                continue;
            }
            let (existing, previous) = match index.get(&log.id) {
                Some(&i) => (Some(changes[i].oplog.clone()), changes[i].previous),
                None => {
                    let stored = store.get(&log.id)?;
                    let previous = stored.as_ref().map(|o| o.status);
                    (stored, previous)
                }
            };
            if existing.as_ref().is_some_and(|e| e.status == Status::Failed) {
                continue;
            }

            if let Err(e) = log.verify_signatures() {
                debug!(entity = %self.id(), log = %log.id, error = %e, "Rejected oplog");
                outcome.failed.push(log.id);
                if existing.is_none() {
                    let mut failed = log;
                    failed.status = Status::Failed;
                    failed.master_log_id = None;
                    upsert(&mut changes, &mut index, OplogChange { previous, oplog: failed });
                }
                continue;
            }

            let (mut merged, signs_added) = match existing {
                Some(mut e) => {
                    let added = e.merge_signs(&log);
                    (e, added)
                }
                None => {
                    let mut fresh = log;
                    fresh.master_log_id = None;
                    (fresh, true)
                }
            };

            let verdict = masters.evaluate(&merged);
            let derived = if local && verdict.status == Status::Pending {
                Status::Internal
            } else {
                verdict.status
            };
            let next = match previous {
                None => derived,
                Some(p) => advance_status(p, derived),
            };
            if !signs_added && Some(next) == previous {
                continue;
            }
            if next.is_authoritative() && merged.master_log_id.is_none() {
                merged.master_log_id = verdict.master_log_id;
            }
            merged.status = next;

            let became_authoritative =
                next.is_authoritative() && !previous.is_some_and(|p| p.is_authoritative());
            match next {
                Status::Failed => outcome.failed.push(merged.id),
                s if s.is_authoritative() => {
                    if became_authoritative
                        && !self.resolve_target(store, &merged, &mut winners, &mut extra)?
                    {
                        outcome.conflicts.push(merged.id);
                    } else {
                        outcome.applied.push(merged.id);
                    }
                }
                _ => {
                    if local && store.category() == LogCategory::Object {
                        // our own view of the object before it is authoritative
                        if let Some(op) = self.object_write(&merged)? {
                            extra.push(op);
                        }
                    }
                    outcome.pending.push(merged.id);
                }
            }
            upsert(&mut changes, &mut index, OplogChange { previous, oplog: merged });
        }
        Ok((changes, extra, outcome))
    }

    /// Tie-break `oplog` against the current winner of its target. Returns false if it lost.
    fn resolve_target(
        &self,
        store: &OplogStore,
        oplog: &Oplog,
        winners: &mut HashMap<Vec<u8>, Oplog>,
        extra: &mut Vec<WriteOp>,
    ) -> EntityResult<bool> {
        let Some(target) = oplog.op.target() else {
            return Ok(true);
        };
        let current = match winners.get(&target) {
            Some(o) => Some(o.clone()),
            None => match store.winner(&target)? {
                Some(id) => store.get(&id)?,
                None => None,
            },
        };
        if let Some(current) = current {
            if current.id == oplog.id {
                return Ok(true);
            }
            if !wins(oplog, &current) {
                return Ok(false);
            }
        }
        extra.push(store.put_winner(&target, &oplog.id)?);
        if let Some(op) = self.object_write(oplog)? {
            extra.push(op);
        }
        winners.insert(target, oplog.clone());
        Ok(true)
    }

    /// Master category: statuses are re-derived for the whole chain
    fn merge_master_locked(
        &self,
        store: &OplogStore,
        incoming: Vec<Oplog>,
        local: bool,
    ) -> EntityResult<(Vec<OplogChange>, Vec<WriteOp>, MergeOutcome, MasterSet)> {
        let mut chain: BTreeMap<LogId, Oplog> =
            store.all()?.into_iter().map(|o| (o.id, o)).collect();
        let original: HashMap<LogId, Status> = chain.iter().map(|(id, o)| (*id, o.status)).collect();
        let mut touched: BTreeSet<LogId> = BTreeSet::new();
        let mut outcome = MergeOutcome::default();

        for log in incoming {
            if log.category() != LogCategory::Master {
                outcome.failed.push(log.id);
                continue;
            }
            if chain.get(&log.id).is_some_and(|e| e.status == Status::Failed) {
                continue;
            }
            if let Err(e) = log.verify_signatures() {
                debug!(entity = %self.id(), log = %log.id, error = %e, "Rejected master oplog");
                outcome.failed.push(log.id);
                if !chain.contains_key(&log.id) {
                    let mut failed = log;
                    failed.status = Status::Failed;
                    failed.master_log_id = None;
                    touched.insert(failed.id);
                    chain.insert(failed.id, failed);
                }
                continue;
            }
            match chain.get_mut(&log.id) {
                Some(existing) => {
                    if existing.merge_signs(&log) {
                        touched.insert(log.id);
                    }
                }
                None => {
                    let mut fresh = log;
                    fresh.master_log_id = None;
                    fresh.status = if local { Status::Internal } else { Status::Pending };
                    touched.insert(fresh.id);
                    chain.insert(fresh.id, fresh);
                }
            }
        }

        let creator = read(&self.record).creator_id;
        let all: Vec<Oplog> = chain.values().cloned().collect();
        let masters = MasterSet::compute(creator, &all, self.config.master_threshold);

        for (id, log) in chain.iter_mut() {
            let Some(derived) = masters.derived_status(id) else {
                continue;
            };
            let derived = if derived == Status::Pending && log.status == Status::Internal {
                Status::Internal
            } else {
                derived
            };
            let next = advance_status(log.status, derived);
            if next != log.status {
                log.status = next;
                if next.is_authoritative() && log.master_log_id.is_none() {
                    log.master_log_id = masters.is_valid_internal_oplog(&log.master_signs).0;
                }
                touched.insert(*id);
            }
        }

        let mut changes = Vec::with_capacity(touched.len());
        for id in touched {
            let Some(oplog) = chain.remove(&id) else {
                continue;
            };
            let previous = original.get(&id).copied();
            match oplog.status {
                Status::Failed => {
                    if !outcome.failed.contains(&id) {
                        outcome.failed.push(id);
                    }
                }
                s if s.is_authoritative() => {
                    if previous != Some(s) {
                        outcome.applied.push(id);
                    }
                }
                _ => outcome.pending.push(id),
            }
            changes.push(OplogChange { previous, oplog });
        }
        Ok((changes, Vec::new(), outcome, masters))
    }

    /// Re-derive the entity status after a merge
    fn refresh_record(&self, masters: &MasterSet, changes: &[OplogChange]) -> EntityResult<()> {
        let my_id = self.me.user_id();
        let is_master = masters.is_master(&my_id);
        let membership = self.member_oplog_kind(&my_id);
        let last_applied = changes
            .iter()
            .filter(|c| c.oplog.status.is_authoritative())
            .map(|c| c.oplog.id)
            .max();

        let mut record = write(&self.record);
        let before = record.clone();
        record.status = match record.status {
            _ if masters.is_entity_deleted() => EntityStatus::Deleted,
            EntityStatus::Deleted => EntityStatus::Deleted,
            _ if is_master || membership == Some(true) => EntityStatus::Alive,
            EntityStatus::Alive if membership == Some(false) => EntityStatus::Terminated,
            status => status,
        };
        if let Some(id) = last_applied {
            if record.log_id.map_or(true, |current| id > current) {
                record.log_id = Some(id);
                record.update_ts = Timestamp::now();
            }
        }
        if *record == before {
            return Ok(());
        }
        if record.status != before.status {
            info!(
                entity = %record.id,
                from = ?before.status,
                to = ?record.status,
                "Entity status changed"
            );
        }
        let key = scoped_key(ENTITY_PREFIX, &record.id, &[]);
        let bytes = encode(&*record)?;
        drop(record);
        self.storage.put(&key, &bytes)?;
        Ok(())
    }

    // ---- sync ----

    fn check_peer(&self, peer: &PeerId) -> EntityResult<UserId> {
        read(&self.peers)
            .get(peer)
            .map(|p| p.user_id)
            .ok_or(EntityError::PeerNotRegistered(*peer))
    }

    /// Open a Merkle round per category with `peer`
    pub fn sync_oplog(&self, peer: &PeerId) -> EntityResult<Vec<SyncMessage>> {
        self.check_peer(peer)?;
        Ok(LogCategory::ALL
            .iter()
            .map(|&category| self.sync_oplog_category(category))
            .collect())
    }

    pub fn sync_oplog_category(&self, category: LogCategory) -> SyncMessage {
        metrics::sync_round("merkle");
        start_round(&self.store(category).merkle(), category)
    }

    /// Retry our own pending oplogs against the current master set and offer
    /// what is still pending to `peer` for signing.
    pub fn sync_pending_oplog(&self, peer: &PeerId) -> EntityResult<Vec<SyncMessage>> {
        self.check_peer(peer)?;
        let mut messages = Vec::new();
        for category in LogCategory::ALL {
            let waiting = self.waiting_oplogs(category)?;
            if waiting.is_empty() {
                continue;
            }
            self.merge_category(category, waiting, false)?;

            let still = self.waiting_oplogs(category)?;
            if still.is_empty() {
                continue;
            }
            metrics::sync_round("pending");
            for chunk in still.chunks(self.config.batch_size.max(1)) {
                messages.push(SyncMessage::PendingOplog {
                    category,
                    oplogs: chunk.to_vec(),
                });
            }
        }
        Ok(messages)
    }

    fn waiting_oplogs(&self, category: LogCategory) -> EntityResult<Vec<Oplog>> {
        Ok(self
            .store(category)
            .all()?
            .into_iter()
            .filter(|o| matches!(o.status, Status::Internal | Status::Pending))
            .collect())
    }

    /// Handle one sync message from `peer`, returning the replies
    pub fn handle_sync(&self, peer: &PeerId, message: SyncMessage) -> EntityResult<Vec<SyncMessage>> {
        self.check_peer(peer)?;
        let batch_size = self.config.batch_size;
        match message {
            SyncMessage::Merkle {
                category,
                level,
                ranges,
                nodes,
            } => {
                let step = respond(
                    &self.store(category).merkle(),
                    level,
                    ranges.as_deref(),
                    &nodes,
                );
                match step {
                    SyncStep::InSync => Ok(Vec::new()),
                    SyncStep::Descend {
                        level,
                        ranges,
                        nodes,
                    } => Ok(vec![SyncMessage::Merkle {
                        category,
                        level,
                        ranges: Some(ranges),
                        nodes,
                    }]),
                    SyncStep::Exchange { buckets } => {
                        let mine = self.store(category).in_buckets(&buckets)?;
                        Ok(chunk_oplogs(category, mine, buckets, batch_size))
                    }
                }
            }
            SyncMessage::OplogData {
                category,
                oplogs,
                request,
            } => {
                let oplogs = self.scope(category, oplogs)?;
                if !oplogs.is_empty() {
                    self.merge_oplogs(oplogs)?;
                }
                if request.is_empty() {
                    return Ok(Vec::new());
                }
                let mine = self.store(category).in_buckets(&request)?;
                if mine.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(chunk_oplogs(category, mine, Vec::new(), batch_size))
            }
            SyncMessage::PendingOplog { category, oplogs } => {
                let oplogs = self.scope(category, oplogs)?;
                let ids: Vec<LogId> = oplogs.iter().map(|o| o.id).collect();
                self.merge_oplogs(oplogs)?;
                self.co_sign(category, &ids)?;

                let replies: Vec<Oplog> = ids
                    .iter()
                    .filter_map(|id| self.store(category).get(id).transpose())
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .filter(|o| !o.master_signs.is_empty())
                    .collect();
                if replies.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![SyncMessage::PendingOplogAck {
                    category,
                    oplogs: replies,
                }])
            }
            SyncMessage::PendingOplogAck { category, oplogs } => {
                let oplogs = self.scope(category, oplogs)?;
                self.merge_oplogs(oplogs)?;
                Ok(Vec::new())
            }
        }
    }

    fn scope(&self, category: LogCategory, oplogs: Vec<Oplog>) -> EntityResult<Vec<Oplog>> {
        let id = self.id();
        if oplogs
            .iter()
            .any(|o| o.entity_id != id || o.category() != category)
        {
            return Err(EntityError::WrongScope {
                entity: id,
                category,
            });
        }
        Ok(oplogs)
    }

    /// Add our master signature to pending oplogs whose creator may author them
    fn co_sign(&self, category: LogCategory, ids: &[LogId]) -> EntityResult<()> {
        let masters = self.master_set()?;
        let my_id = self.me.user_id();
        let Some(master_log_id) = masters.approving_log(&my_id) else {
            return Ok(());
        };

        let mut signed = Vec::new();
        for id in ids {
            let Some(mut oplog) = self.store(category).get(id)? else {
                continue;
            };
            if !matches!(oplog.status, Status::Pending | Status::Internal) {
                continue;
            }
            let creator = oplog.creator_id;
            let allowed = masters.is_master(&creator)
                || (category != LogCategory::Master && self.is_member(&creator));
            if !allowed {
                continue;
            }
            if oplog.add_master_sign(self.me.user_key(), master_log_id)? {
                signed.push(oplog);
            }
        }
        if !signed.is_empty() {
            debug!(entity = %self.id(), category = %category, count = signed.len(), "Co-signed pending oplogs");
            self.merge_category(category, signed, false)?;
        }
        Ok(())
    }

    /// Push every authoritative oplog of categories whose root hash has been
    /// stable for `quiet`, to recover from silently lost deltas.
    pub fn try_force_sync(&self, quiet: Duration) -> EntityResult<Vec<SyncMessage>> {
        let mut messages = Vec::new();
        for category in LogCategory::ALL {
            let store = self.store(category);
            {
                let mut tree = store.merkle_mut();
                if tree.is_empty() || tree.root_stable_for() < quiet {
                    continue;
                }
                tree.touch();
            }
            let all: Vec<Oplog> = store
                .all()?
                .into_iter()
                .filter(|o| o.status.is_authoritative())
                .collect();
            metrics::sync_round("force");
            messages.extend(chunk_oplogs(category, all, Vec::new(), self.config.batch_size));
        }
        Ok(messages)
    }
}

fn upsert(changes: &mut Vec<OplogChange>, index: &mut HashMap<LogId, usize>, change: OplogChange) {
    match index.get(&change.oplog.id) {
        Some(&i) => changes[i] = change,
        None => {
            index.insert(change.oplog.id, changes.len());
            changes.push(change);
        }
    }
}

impl Entity for EntityProtocolManager {
    fn id(&self) -> EntityId {
        read(&self.record).id
    }

    fn entity_type(&self) -> EntityType {
        read(&self.record).entity_type
    }

    fn info(&self) -> EntityInfo {
        let owner_ids = match self.master_set() {
            Ok(masters) => masters.masters(),
            Err(e) => {
                warn!(error = %e, "Failed to derive master set");
                Vec::new()
            }
        };
        let record = self.record();
        EntityInfo {
            id: record.id,
            entity_type: record.entity_type,
            status: record.status,
            creator_id: record.creator_id,
            owner_ids,
            update_ts: record.update_ts,
            log_id: record.log_id,
        }
    }
}

impl ProtocolManager for EntityProtocolManager {
    fn is_my_device(&self, user: &UserId) -> bool {
        *user == self.me.user_id()
    }

    fn is_important(&self, user: &UserId) -> bool {
        match self.master_set() {
            Ok(masters) => masters.is_master(user),
            Err(e) => {
                warn!(entity = %self.id(), error = %e, "Failed to derive master set");
                false
            }
        }
    }

    fn is_member(&self, user: &UserId) -> bool {
        self.member_oplog_kind(user) == Some(true)
    }

    fn is_pending(&self, user: &UserId) -> bool {
        if self.master_set().is_ok_and(|m| m.is_pending_master(user)) {
            return true;
        }
        match self.store(LogCategory::Member).all() {
            Ok(logs) => logs.iter().any(|o| {
                matches!(o.status, Status::Pending | Status::Internal)
                    && matches!(&o.op, OpKind::AddMember { user_id, .. } if user_id == user)
            }),
            Err(_) => false,
        }
    }

    fn register_peer(&self, peer: PeerId, user: UserId, peer_type: PeerType) -> bool {
        let mut peers = write(&self.peers);
        let entry = RegisteredPeer {
            user_id: user,
            peer_type,
        };
        match peers.insert(peer, entry) {
            Some(old) if old.peer_type == peer_type && old.user_id == user => false,
            _ => {
                debug!(entity = %self.id(), peer = %peer, tier = %peer_type, "Registered peer");
                true
            }
        }
    }

    fn unregister_peer(&self, peer: &PeerId) -> bool {
        write(&self.peers).remove(peer).is_some()
    }

    fn registered_peers(&self) -> Vec<(PeerId, PeerType)> {
        read(&self.peers)
            .iter()
            .map(|(id, p)| (*id, p.peer_type))
            .collect()
    }
}
