/*
    router.rs - Resource owner for everything shared between peer loops

    The Router owns:
    - the tiered peer registry
    - the entity registry (entity id -> protocol manager)
    - the op-key and join-key routing tables
    - identify sessions, join requests, join slots and pending confirmations
    - the dial history

    Inbound flow (one call per message, from the peer's own task):

        transport bytes
             |
             v
        unmarshal (checksum, node hint, code, inner hash)
             |
             +-- Identify*        -> identify state machine -> finish_identify
             +-- Join / JoinAck   -> join-key table -> join state machines
             +-- Op               -> op-key table -> decrypt -> ProtocolManager::handle_sync
             +-- OpFail / RequestOpKey* / OpCheckMember* / EntityDeleted

    Replies are queued on the peer's outbound channel; nothing here awaits.

    Lock discipline: each table below has its own mutex. No method holds two of
    them at once, and none is held while calling into a protocol manager or the
    peer registry.
*/

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codes::{CodeType, JoinAckOp, JoinOp, OpType};
use super::dial_history::DialHistory;
use super::envelope::{decrypt, encrypt, marshal, unmarshal, Decoded};
use super::errors::{AdmissionError, CodecError, RouterError, RouterResult};
use super::identify::{
    answer_challenge, ChallengeAckMsg, ChallengeMsg, IdentifyAckMsg, IdentifyFailMsg,
    IdentifyPeerMsg, IdentifySession, WithMyIdMsg,
};
use super::join::{
    answer_join_challenge, ConfirmJoin, JoinApproveMsg, JoinChallengeMsg, JoinEntityMsg,
    JoinMsg, JoinRejectMsg, JoinRequest, JoinSlot, JoinState,
};
use super::key_tables::KeyTables;
use super::messages::{
    EntityDeletedMsg, OpCheckMemberAckMsg, OpCheckMemberMsg, RequestOpKeyAckMsg,
    RequestOpKeyFailMsg, RequestOpKeyMsg,
};
use super::peer::Peer;
use super::peer_registry::{PeerInfo, PeerRegistry};
use crate::config::Config;
use crate::core_entity::{
    Entity, EntityConfig, EntityError, EntityProtocolManager, EntityRegistry, EntityStatus,
    EntityType, KeyInfo, MyEntity, PeerType, ProtocolManager, RouteHash,
};
use crate::core_identity::{random_bytes, MyIdentity, PeerId, UserId};
use crate::core_oplog::{EntityId, LogCategory, LogId, OpKind, SyncMessage, Timestamp};
use crate::core_store::Storage;
use crate::metrics;

/// Summary of the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub peer_count: usize,
    pub entity_count: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Router {
    me: Arc<MyIdentity>,
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    entity_config: EntityConfig,
    peers: PeerRegistry,
    entities: EntityRegistry,
    keys: KeyTables,
    identify: Mutex<HashMap<PeerId, IdentifySession>>,
    join_requests: Mutex<HashMap<RouteHash, JoinRequest>>,
    join_slots: Mutex<HashMap<RouteHash, JoinSlot>>,
    confirm_joins: Mutex<HashMap<Uuid, ConfirmJoin>>,
    dial_history: DialHistory,
    /// Cancelled when sync rounds must stop; checked between batches
    quit: CancellationToken,
}

impl Router {
    pub fn new(me: Arc<MyIdentity>, config: Arc<Config>, storage: Arc<dyn Storage>) -> Self {
        let handshake = &config.handshake;
        Self {
            entity_config: EntityConfig::from(config.as_ref()),
            peers: PeerRegistry::new(config.peers.clone()),
            entities: EntityRegistry::new(),
            keys: KeyTables::new(),
            identify: Mutex::new(HashMap::new()),
            join_requests: Mutex::new(HashMap::new()),
            join_slots: Mutex::new(HashMap::new()),
            confirm_joins: Mutex::new(HashMap::new()),
            dial_history: DialHistory::new(handshake.dial_history_capacity, handshake.dial_history_ttl),
            quit: CancellationToken::new(),
            me,
            config,
            storage,
        }
    }

    pub fn me(&self) -> &Arc<MyIdentity> {
        &self.me
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn key_tables(&self) -> &KeyTables {
        &self.keys
    }

    /// Abort running sync rounds and refuse new ones
    pub fn stop_sync(&self) {
        self.quit.cancel();
    }

    fn quitting(&self) -> bool {
        self.quit.is_cancelled()
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            peer_id: self.me.peer_id(),
            user_id: self.me.user_id(),
            peer_count: self.peers.len(),
            entity_count: self.entities.len(),
        }
    }

    pub fn count_peers(&self) -> BTreeMap<PeerType, usize> {
        self.peers.count_peers()
    }

    pub fn peer_list(&self) -> Vec<PeerInfo> {
        self.peers.peers()
    }

    pub fn peer_by_user(&self, user: &UserId) -> Option<Arc<Peer>> {
        self.peers.peer_by_user(user)
    }

    // ---- entities ----

    pub fn entity(&self, id: &EntityId) -> Option<Arc<EntityProtocolManager>> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> Vec<Arc<EntityProtocolManager>> {
        self.entities.all()
    }

    pub fn create_entity(&self, entity_type: EntityType) -> RouterResult<Arc<EntityProtocolManager>> {
        let pm = Arc::new(EntityProtocolManager::create(
            self.me.clone(),
            self.storage.clone(),
            self.entity_config.clone(),
            entity_type,
        )?);
        self.register_entity(pm.clone());
        Ok(pm)
    }

    /// Load a persisted entity and register it
    pub fn load_entity(&self, id: EntityId) -> RouterResult<Arc<EntityProtocolManager>> {
        let pm = Arc::new(EntityProtocolManager::load(
            self.me.clone(),
            self.storage.clone(),
            self.entity_config.clone(),
            id,
        )?);
        if !pm.status().is_closed() {
            self.register_entity(pm.clone());
        }
        Ok(pm)
    }

    /// Make an entity routable and classify every connected peer for it
    pub fn register_entity(&self, pm: Arc<EntityProtocolManager>) {
        let id = pm.id();
        if self.entities.insert(pm.clone()).is_some() {
            debug!(entity = %id, "Replaced registered entity");
        }
        self.refresh_keys(&pm);
        let registered = self.classify_peers(&pm);
        info!(entity = %id, peers = registered, "Registered entity");
    }

    pub fn unregister_entity(&self, id: &EntityId) -> Option<Arc<EntityProtocolManager>> {
        let pm = self.entities.remove(id)?;
        let removed = self.keys.remove_entity(id);
        lock(&self.join_slots).retain(|_, s| s.entity_id != *id);
        lock(&self.confirm_joins).retain(|_, c| c.entity_id != *id);
        info!(entity = %id, keys = removed, status = ?pm.status(), "Unregistered entity");
        Some(pm)
    }

    fn refresh_keys(&self, pm: &EntityProtocolManager) {
        self.keys.sync_entity(pm.id(), pm.op_keys(), pm.join_key());
    }

    /// Walk connected peers highest priority first and (re)classify them for `pm`.
    /// Peers that deserve a higher global tier are promoted. Returns how many
    /// peers are registered with the entity afterwards.
    fn classify_peers(&self, pm: &Arc<EntityProtocolManager>) -> usize {
        for peer in self.peers.by_priority() {
            let Some(user) = peer.user_id() else {
                continue;
            };
            match pm.peer_type(&user) {
                Some(peer_type) => {
                    if pm.register_peer(peer.id(), user, peer_type) {
                        self.sync_entity_with(pm, &peer);
                    }
                    if let Err(e) = self.peers.set_peer_type(&peer, peer_type, false) {
                        debug!(peer = %peer.id(), tier = %peer_type, error = %e, "Promotion refused");
                    }
                }
                None => {
                    pm.unregister_peer(&peer.id());
                }
            }
        }
        pm.registered_peers().len()
    }

    /// Follow-up after a protocol manager merged remote data
    fn after_merge(&self, pm: &Arc<EntityProtocolManager>, category: LogCategory, before: Option<LogId>) {
        if pm.status().is_closed() {
            self.unregister_entity(&pm.id());
            return;
        }
        let changed = pm.record().log_id != before;
        if changed && matches!(category, LogCategory::Master | LogCategory::Member) {
            self.classify_peers(pm);
        }
    }

    pub fn rotate_op_key(&self, entity_id: &EntityId) -> RouterResult<KeyInfo> {
        let pm = self
            .entities
            .get(entity_id)
            .ok_or(RouterError::UnknownEntity(*entity_id))?;
        let key = pm.rotate_op_key()?;
        self.refresh_keys(&pm);
        Ok(key)
    }

    /// Delete an entity we master and tell its peers
    pub fn delete_entity(&self, entity_id: &EntityId) -> RouterResult<()> {
        let pm = self
            .entities
            .get(entity_id)
            .ok_or(RouterError::UnknownEntity(*entity_id))?;
        let oplog = pm.delete_entity()?;
        let msg = EntityDeletedMsg {
            entity_id: *entity_id,
            oplog,
        };
        for (peer_id, _) in pm.registered_peers() {
            if let Some(peer) = self.peers.get(&peer_id) {
                if let Err(e) = self.send_plain(&peer, CodeType::EntityDeleted, RouteHash::EMPTY, &msg) {
                    warn!(peer = %peer_id, error = %e, "Failed to announce entity deletion");
                }
            }
        }
        self.unregister_entity(entity_id);
        Ok(())
    }

    // ---- peers ----

    /// Admit a freshly connected peer at Random and start identifying it.
    /// On error the caller must close the connection.
    pub fn on_peer_connected(&self, peer: &Arc<Peer>) -> RouterResult<()> {
        self.peers.admit(peer, PeerType::Random)?;
        info!(peer = %peer.id(), version = peer.version(), "Peer connected");
        let dialed = self.dial_history.get(&peer.id()).is_some();
        if dialed || self.config.node.identify_on_connect {
            self.identify_peer(peer)?;
        }
        Ok(())
    }

    /// Forget a peer whose connection ended
    pub fn remove_peer(&self, id: &PeerId) {
        self.peers.remove(id);
        for pm in self.entities.all() {
            pm.unregister_peer(id);
        }
        lock(&self.identify).remove(id);
        lock(&self.join_slots).retain(|_, s| s.peer != *id);
        lock(&self.confirm_joins).retain(|_, c| c.peer != *id);
        for req in lock(&self.join_requests).values_mut() {
            if req.owner == *id {
                req.expire();
            }
        }
        debug!(peer = %id, "Peer removed");
    }

    /// Close every peer and forget them
    pub fn close_all_peers(&self) {
        for peer in self.peers.clear() {
            peer.close();
        }
        for pm in self.entities.all() {
            for (peer_id, _) in pm.registered_peers() {
                pm.unregister_peer(&peer_id);
            }
        }
        lock(&self.identify).clear();
        lock(&self.join_slots).clear();
        lock(&self.confirm_joins).clear();
    }

    /// Remember that `peer_id` was dialed for the entity owning `hash`.
    /// If it is already connected and identified, bind it right away.
    pub fn add_dial(&self, peer_id: PeerId, hash: RouteHash, peer_type: PeerType) {
        if let Some(peer) = self.peers.get(&peer_id) {
            if let (Some(user), Some(entry)) = (peer.user_id(), self.keys.op(&hash)) {
                if let Some(pm) = self.entities.get(&entry.entity_id) {
                    if pm.register_peer(peer_id, user, peer_type) {
                        self.sync_entity_with(&pm, &peer);
                    }
                    if let Err(e) = self.peers.set_peer_type(&peer, peer_type, false) {
                        debug!(peer = %peer_id, error = %e, "Promotion refused");
                    }
                    return;
                }
            }
        }
        self.dial_history.add(peer_id, hash, peer_type);
    }

    /// Start (or restart) identifying `peer`
    pub fn identify_peer(&self, peer: &Arc<Peer>) -> RouterResult<()> {
        let session = IdentifySession::start(Instant::now(), self.config.handshake.identify_timeout);
        lock(&self.identify).insert(peer.id(), session);
        self.send_identify_request(peer)
    }

    fn send_identify_request(&self, peer: &Peer) -> RouterResult<()> {
        let msg = IdentifyPeerMsg {
            protocol_version: self.config.node.protocol_version,
        };
        self.send_plain(peer, CodeType::IdentifyPeer, RouteHash::EMPTY, &msg)
    }

    /// The peer proved it is `user`: reset it to Random and classify it afresh
    pub fn finish_identify(&self, peer: &Arc<Peer>, user: UserId) -> RouterResult<()> {
        peer.set_user_id(Some(user));
        match self.peers.set_peer_type(peer, PeerType::Random, true) {
            Ok(_) => {}
            Err(AdmissionError::AlreadyRegistered(user)) => {
                warn!(peer = %peer.id(), user = %user, "Duplicate identity, closing peer");
                peer.close();
                return Err(AdmissionError::AlreadyRegistered(user).into());
            }
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "Cannot reset identified peer");
                return Ok(());
            }
        }
        info!(peer = %peer.id(), user = %user, "Peer identified");
        self.setup_peer(peer);
        Ok(())
    }

    /// Register an identified peer with every entity interested in it
    fn setup_peer(&self, peer: &Arc<Peer>) {
        let Some(user) = peer.user_id() else {
            return;
        };
        let dial = self.dial_history.remove(&peer.id());
        let dialed_entity = dial
            .as_ref()
            .and_then(|d| self.keys.op(&d.hash))
            .map(|e| e.entity_id);

        let mut best: Option<PeerType> = None;
        let mut registered = Vec::new();
        for pm in self.entities.all() {
            let mut peer_type = pm.peer_type(&user);
            if Some(pm.id()) == dialed_entity {
                peer_type = peer_type.max(dial.as_ref().map(|d| d.peer_type));
            }
            let Some(peer_type) = peer_type else {
                continue;
            };
            pm.register_peer(peer.id(), user, peer_type);
            best = best.max(Some(peer_type));
            registered.push(pm);
        }

        if MyEntity::is_my_device(self.me.as_ref(), &user) {
            best = Some(PeerType::Me);
        }
        if let Some(peer_type) = best {
            if let Err(e) = self.peers.set_peer_type(peer, peer_type, false) {
                warn!(peer = %peer.id(), tier = %peer_type, error = %e, "Peer stays at a lower tier");
            }
        }
        for pm in registered {
            self.sync_entity_with(&pm, peer);
        }
    }

    // ---- sending ----

    fn send_data(&self, peer: &Peer, code: CodeType, hash: RouteHash, data: Vec<u8>) -> RouterResult<()> {
        let wire = marshal(code, hash, data, Some(peer.id()))?;
        peer.send(code.as_u64(), wire)
    }

    fn send_plain<T: Serialize>(&self, peer: &Peer, code: CodeType, hash: RouteHash, msg: &T) -> RouterResult<()> {
        self.send_data(peer, code, hash, bincode::serialize(msg)?)
    }

    fn send_encrypted<T: Serialize>(
        &self,
        peer: &Peer,
        code: CodeType,
        op: u32,
        key: &KeyInfo,
        msg: &T,
    ) -> RouterResult<()> {
        let data = encrypt(op, &bincode::serialize(msg)?, key)?;
        self.send_data(peer, code, key.route_hash(), data)
    }

    fn send_sync(&self, pm: &EntityProtocolManager, peer: &Peer, msg: &SyncMessage) -> RouterResult<()> {
        let key = pm.current_op_key().ok_or(RouterError::NoOpKey(pm.id()))?;
        self.send_encrypted(peer, CodeType::Op, OpType::of(msg) as u32, &key, msg)
    }

    fn sync_entity_with(&self, pm: &EntityProtocolManager, peer: &Peer) {
        let messages = match pm.sync_oplog(&peer.id()) {
            Ok(m) => m,
            Err(e) => {
                debug!(entity = %pm.id(), peer = %peer.id(), error = %e, "Skipping initial sync");
                return;
            }
        };
        for msg in &messages {
            if self.quitting() {
                return;
            }
            if let Err(e) = self.send_sync(pm, peer, msg) {
                debug!(entity = %pm.id(), peer = %peer.id(), error = %e, "Initial sync aborted");
                return;
            }
        }
    }

    fn broadcast(&self, pm: &EntityProtocolManager, messages: &[SyncMessage]) {
        if messages.is_empty() {
            return;
        }
        for (peer_id, _) in pm.registered_peers() {
            let Some(peer) = self.peers.get(&peer_id) else {
                continue;
            };
            for msg in messages {
                if self.quitting() {
                    return;
                }
                if let Err(e) = self.send_sync(pm, &peer, msg) {
                    debug!(entity = %pm.id(), peer = %peer_id, error = %e, "Sync round aborted");
                    break;
                }
            }
        }
    }

    /// Open a Merkle round for one category with every registered peer
    pub fn sync_category(&self, category: LogCategory) {
        for pm in self.entities.all() {
            if pm.status().is_closed() {
                continue;
            }
            let msg = pm.sync_oplog_category(category);
            self.broadcast(&pm, std::slice::from_ref(&msg));
        }
    }

    /// Full Merkle sync of every entity with every registered peer
    pub fn sync_all(&self) {
        for category in LogCategory::ALL {
            self.sync_category(category);
        }
    }

    /// Offer our waiting oplogs for signing, and ask masters about our own
    /// membership while we are still pending
    pub fn sync_pending(&self) {
        for pm in self.entities.all() {
            if pm.status().is_closed() {
                continue;
            }
            let pending_member = pm.status() == EntityStatus::Pending;
            for (peer_id, peer_type) in pm.registered_peers() {
                if self.quitting() {
                    return;
                }
                let Some(peer) = self.peers.get(&peer_id) else {
                    continue;
                };
                match pm.sync_pending_oplog(&peer_id) {
                    Ok(messages) => {
                        for msg in &messages {
                            if let Err(e) = self.send_sync(&pm, &peer, msg) {
                                debug!(entity = %pm.id(), peer = %peer_id, error = %e, "Pending sync aborted");
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(entity = %pm.id(), error = %e, "Pending sync failed"),
                }
                if pending_member && peer_type == PeerType::Important {
                    let msg = OpCheckMemberMsg { entity_id: pm.id() };
                    if let Err(e) = self.send_plain(&peer, CodeType::OpCheckMember, RouteHash::EMPTY, &msg) {
                        debug!(peer = %peer_id, error = %e, "Member check not sent");
                    }
                }
            }
        }
    }

    /// Push full state for categories whose root has been quiet for `quiet`
    pub fn force_sync(&self, quiet: Duration) {
        for pm in self.entities.all() {
            if pm.status().is_closed() {
                continue;
            }
            match pm.try_force_sync(quiet) {
                Ok(messages) => self.broadcast(&pm, &messages),
                Err(e) => warn!(entity = %pm.id(), error = %e, "Force sync failed"),
            }
        }
    }

    pub fn request_op_key(&self, entity_id: &EntityId, peer_id: &PeerId) -> RouterResult<()> {
        let peer = self.peers.get(peer_id).ok_or(RouterError::PeerNotFound(*peer_id))?;
        let msg = RequestOpKeyMsg {
            entity_id: *entity_id,
        };
        self.send_plain(&peer, CodeType::RequestOpKey, RouteHash::EMPTY, &msg)
    }

    pub fn check_member(&self, entity_id: &EntityId, peer_id: &PeerId) -> RouterResult<()> {
        let peer = self.peers.get(peer_id).ok_or(RouterError::PeerNotFound(*peer_id))?;
        let msg = OpCheckMemberMsg {
            entity_id: *entity_id,
        };
        self.send_plain(&peer, CodeType::OpCheckMember, RouteHash::EMPTY, &msg)
    }

    // ---- join ----

    /// Ask `owner` to let us into `entity_id`, using the entity's join-key.
    /// Returns the hash that names this attempt.
    pub fn join_entity(&self, entity_id: EntityId, join_key: KeyInfo, owner: PeerId) -> RouterResult<RouteHash> {
        let peer = self.peers.get(&owner).ok_or(RouterError::PeerNotFound(owner))?;
        let mut request = JoinRequest::new(
            entity_id,
            join_key,
            owner,
            Instant::now(),
            self.config.handshake.join_timeout,
        );
        let msg = JoinMsg {
            entity_id,
            user_id: self.me.user_id(),
            public_key: self.me.user_public_key(),
        };
        request.on_sent()?;
        let hash = request.hash();
        let key = request.join_key().clone();
        lock(&self.join_requests).insert(hash, request);

        if let Err(e) = self.send_encrypted(&peer, CodeType::Join, JoinOp::Request as u32, &key, &msg) {
            lock(&self.join_requests).remove(&hash);
            return Err(e);
        }
        info!(entity = %entity_id, owner = %owner, "Join requested");
        Ok(hash)
    }

    pub fn join_state(&self, hash: &RouteHash) -> Option<JoinState> {
        lock(&self.join_requests).get(hash).map(|r| r.state())
    }

    /// Joins waiting for `confirm_join`
    pub fn confirm_joins(&self) -> Vec<ConfirmJoin> {
        lock(&self.confirm_joins).values().cloned().collect()
    }

    /// Approve or reject a verified join
    pub fn confirm_join(&self, id: &Uuid, approve: bool) -> RouterResult<()> {
        let confirm = lock(&self.confirm_joins)
            .remove(id)
            .ok_or_else(|| RouterError::Join(format!("no pending join {}", id)))?;
        let pm = self
            .entities
            .get(&confirm.entity_id)
            .ok_or(RouterError::UnknownEntity(confirm.entity_id))?;
        let key = self
            .keys
            .join(&confirm.join_hash)
            .map(|e| e.key)
            .ok_or(RouterError::UnknownRouteHash(confirm.join_hash))?;
        let peer = self.peers.get(&confirm.peer);

        if !approve {
            if let Some(peer) = &peer {
                self.send_join_reject(peer, &key, "rejected by owner")?;
            }
            metrics::handshake("join", "rejected");
            info!(entity = %confirm.entity_id, user = %confirm.user_id, "Join rejected");
            return Ok(());
        }

        let Some(peer) = peer else {
            return Err(RouterError::PeerNotFound(confirm.peer));
        };
        if peer.user_id().is_none() {
            peer.set_user_id(Some(confirm.user_id));
        }
        if peer.user_id() != Some(confirm.user_id) {
            self.send_join_reject(&peer, &key, "identity mismatch")?;
            return Err(RouterError::Join("joining user differs from identified user".into()));
        }
        // admission first, so a full Member tier leaves no member-oplog behind
        let previous = self.peers.tier_of(&peer.id());
        let promoted = match self.peers.set_peer_type(&peer, PeerType::Member, false) {
            Ok(promoted) => promoted,
            Err(e) => {
                self.send_join_reject(&peer, &key, &e.to_string())?;
                metrics::handshake("join", "rejected");
                return Err(e.into());
            }
        };

        let bundle = match pm.approve_join(confirm.user_id, confirm.public_key) {
            Ok(bundle) => bundle,
            Err(e) => {
                if let (true, Some(previous)) = (promoted, previous) {
                    if let Err(demote) = self.peers.set_peer_type(&peer, previous, true) {
                        warn!(peer = %peer.id(), error = %demote, "Could not undo join promotion");
                    }
                }
                self.send_join_reject(&peer, &key, "approval failed")?;
                metrics::handshake("join", "failed");
                warn!(entity = %confirm.entity_id, user = %confirm.user_id, error = %e, "Join approval failed");
                return Err(e.into());
            }
        };
        pm.register_peer(peer.id(), confirm.user_id, PeerType::Member);
        let msg = JoinApproveMsg { bundle };
        self.send_encrypted(&peer, CodeType::JoinAck, JoinAckOp::Approve as u32, &key, &msg)?;
        metrics::handshake("join", "approved");
        info!(entity = %confirm.entity_id, user = %confirm.user_id, "Join approved");
        Ok(())
    }

    fn send_join_reject(&self, peer: &Peer, key: &KeyInfo, reason: &str) -> RouterResult<()> {
        let msg = JoinRejectMsg {
            reason: reason.to_string(),
        };
        self.send_encrypted(peer, CodeType::JoinAck, JoinAckOp::Reject as u32, key, &msg)
    }

    // ---- inbound ----

    /// Decode and dispatch one message from `peer`
    pub fn handle_message(&self, peer: &Arc<Peer>, code: u64, bytes: &[u8]) -> RouterResult<()> {
        metrics::message_received();
        let decoded = unmarshal(bytes, &self.me.peer_id(), self.config.node.max_message_size)?;
        if decoded.code.as_u64() != code {
            return Err(CodecError::HashMismatch.into());
        }

        let code = decoded.code;
        let anonymous_ok = code.is_identify() || matches!(code, CodeType::Join | CodeType::JoinAck);
        if peer.user_id().is_none() && !anonymous_ok {
            return Err(RouterError::UnexpectedMessage {
                code,
                reason: "peer not identified".into(),
            });
        }

        match code {
            CodeType::Join => self.handle_join(peer, decoded),
            CodeType::JoinAck => self.handle_join_ack(peer, decoded),
            CodeType::Op => self.handle_op(peer, decoded),
            CodeType::OpFail => self.handle_op_fail(peer, decoded),
            CodeType::RequireHash => Err(CodecError::InvalidMsgCode(code.as_u64()).into()),
            CodeType::RequestOpKey => self.handle_request_op_key(peer, &decoded.data),
            CodeType::RequestOpKeyFail => {
                let msg: RequestOpKeyFailMsg = bincode::deserialize(&decoded.data)?;
                debug!(peer = %peer.id(), entity = %msg.entity_id, reason = %msg.reason, "Op-key request refused");
                Ok(())
            }
            CodeType::RequestOpKeyAck => self.handle_request_op_key_ack(peer, &decoded.data),
            CodeType::EntityDeleted => self.handle_entity_deleted(peer, &decoded.data),
            CodeType::OpCheckMember => self.handle_op_check_member(peer, &decoded.data),
            CodeType::OpCheckMemberAck => self.handle_op_check_member_ack(peer, &decoded.data),
            CodeType::IdentifyPeer => {
                let _msg: IdentifyPeerMsg = bincode::deserialize(&decoded.data)?;
                let reply = WithMyIdMsg {
                    user_id: self.me.user_id(),
                    public_key: self.me.user_public_key(),
                };
                self.send_plain(peer, CodeType::IdentifyPeerWithMyId, RouteHash::EMPTY, &reply)
            }
            CodeType::IdentifyPeerFail => {
                let msg: IdentifyFailMsg = bincode::deserialize(&decoded.data)?;
                self.fail_identify(peer, &msg.reason);
                Ok(())
            }
            CodeType::IdentifyPeerWithMyId => self.handle_identify_claim(peer, &decoded.data),
            CodeType::IdentifyPeerWithMyIdChallenge => {
                let msg: ChallengeMsg = bincode::deserialize(&decoded.data)?;
                let reply = answer_challenge(&self.me, &msg.salt, &peer.id());
                self.send_plain(peer, CodeType::IdentifyPeerWithMyIdChallengeAck, RouteHash::EMPTY, &reply)
            }
            CodeType::IdentifyPeerWithMyIdChallengeAck => self.handle_identify_proof(peer, &decoded.data),
            CodeType::IdentifyPeerWithMyIdAck => {
                let msg: IdentifyAckMsg = bincode::deserialize(&decoded.data)?;
                debug!(peer = %peer.id(), user = %msg.user_id, "Peer accepted our identity");
                Ok(())
            }
        }
    }

    fn handle_identify_claim(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let claim: WithMyIdMsg = bincode::deserialize(data)?;
        let result = match lock(&self.identify).get_mut(&peer.id()) {
            Some(session) => session.on_claim(claim),
            None => {
                return Err(RouterError::UnexpectedMessage {
                    code: CodeType::IdentifyPeerWithMyId,
                    reason: "no identify session".into(),
                })
            }
        };
        match result {
            Ok(salt) => self.send_plain(
                peer,
                CodeType::IdentifyPeerWithMyIdChallenge,
                RouteHash::EMPTY,
                &ChallengeMsg { salt },
            ),
            Err(e) => {
                self.reject_identify(peer, &e.to_string());
                Err(e)
            }
        }
    }

    fn handle_identify_proof(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let ack: ChallengeAckMsg = bincode::deserialize(data)?;
        let result = match lock(&self.identify).get_mut(&peer.id()) {
            Some(session) => session.on_challenge_ack(&ack, &self.me.peer_id(), &peer.id()),
            None => {
                return Err(RouterError::UnexpectedMessage {
                    code: CodeType::IdentifyPeerWithMyIdChallengeAck,
                    reason: "no identify session".into(),
                })
            }
        };
        let user = match result {
            Ok(user) => user,
            Err(e) => {
                self.reject_identify(peer, &e.to_string());
                return Err(e);
            }
        };
        metrics::handshake("identify", "ok");
        self.finish_identify(peer, user)?;
        self.send_plain(
            peer,
            CodeType::IdentifyPeerWithMyIdAck,
            RouteHash::EMPTY,
            &IdentifyAckMsg { user_id: user },
        )
    }

    /// Mark our session with `peer` failed and tell it why
    fn reject_identify(&self, peer: &Peer, reason: &str) {
        self.fail_identify(peer, reason);
        let msg = IdentifyFailMsg {
            reason: reason.to_string(),
        };
        if let Err(e) = self.send_plain(peer, CodeType::IdentifyPeerFail, RouteHash::EMPTY, &msg) {
            debug!(peer = %peer.id(), error = %e, "Identify failure not delivered");
        }
    }

    fn fail_identify(&self, peer: &Peer, reason: &str) {
        let handshake = &self.config.handshake;
        if let Some(session) = lock(&self.identify).get_mut(&peer.id()) {
            if session.is_in_flight() {
                session.fail(Instant::now(), handshake.identify_backoff, handshake.identify_max_attempts);
                metrics::handshake("identify", "failed");
                debug!(peer = %peer.id(), reason, attempts = session.attempts(), "Identify failed");
            }
        }
    }

    fn handle_op(&self, peer: &Arc<Peer>, decoded: Decoded) -> RouterResult<()> {
        let Some(entry) = self.keys.op(&decoded.hash) else {
            self.send_data(peer, CodeType::OpFail, decoded.hash, Vec::new())?;
            return Err(RouterError::UnknownRouteHash(decoded.hash));
        };
        let (op, payload) = decrypt(&decoded.data, &entry.key)?;
        let msg: SyncMessage = bincode::deserialize(&payload)?;
        if OpType::of(&msg) as u32 != op {
            return Err(CodecError::HashMismatch.into());
        }
        let pm = self
            .entities
            .get(&entry.entity_id)
            .ok_or(RouterError::UnknownEntity(entry.entity_id))?;

        let category = msg.category();
        let before = pm.record().log_id;
        let replies = pm.handle_sync(&peer.id(), msg)?;
        for reply in &replies {
            self.send_sync(&pm, peer, reply)?;
        }
        self.after_merge(&pm, category, before);
        Ok(())
    }

    /// The peer could not route our op-key hash: share keys both ways
    fn handle_op_fail(&self, peer: &Arc<Peer>, decoded: Decoded) -> RouterResult<()> {
        let entry = self
            .keys
            .op(&decoded.hash)
            .ok_or(RouterError::UnknownRouteHash(decoded.hash))?;
        let pm = self
            .entities
            .get(&entry.entity_id)
            .ok_or(RouterError::UnknownEntity(entry.entity_id))?;
        debug!(peer = %peer.id(), entity = %entry.entity_id, "Peer lacks our op-key");

        if self.may_hold_keys(&pm, peer) {
            let msg = RequestOpKeyAckMsg {
                entity_id: entry.entity_id,
                keys: pm.op_keys(),
            };
            self.send_plain(peer, CodeType::RequestOpKeyAck, RouteHash::EMPTY, &msg)?;
        }
        self.request_op_key(&entry.entity_id, &peer.id())
    }

    /// Whether `peer` is allowed to hold the entity's op-keys
    fn may_hold_keys(&self, pm: &EntityProtocolManager, peer: &Peer) -> bool {
        peer.user_id()
            .and_then(|user| pm.peer_type(&user))
            .is_some_and(|t| t >= PeerType::Member)
    }

    fn handle_request_op_key(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let msg: RequestOpKeyMsg = bincode::deserialize(data)?;
        let pm = self.entities.get(&msg.entity_id);
        match pm {
            Some(pm) if self.may_hold_keys(&pm, peer) => {
                let reply = RequestOpKeyAckMsg {
                    entity_id: msg.entity_id,
                    keys: pm.op_keys(),
                };
                self.send_plain(peer, CodeType::RequestOpKeyAck, RouteHash::EMPTY, &reply)
            }
            _ => {
                let reply = RequestOpKeyFailMsg {
                    entity_id: msg.entity_id,
                    reason: "not a member".into(),
                };
                self.send_plain(peer, CodeType::RequestOpKeyFail, RouteHash::EMPTY, &reply)
            }
        }
    }

    fn handle_request_op_key_ack(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let msg: RequestOpKeyAckMsg = bincode::deserialize(data)?;
        let pm = self
            .entities
            .get(&msg.entity_id)
            .ok_or(RouterError::UnknownEntity(msg.entity_id))?;
        if !self.may_hold_keys(&pm, peer) {
            return Err(RouterError::UnexpectedMessage {
                code: CodeType::RequestOpKeyAck,
                reason: "keys from a non-member".into(),
            });
        }
        let added = pm.install_op_keys(msg.keys)?;
        if added > 0 {
            self.refresh_keys(&pm);
            debug!(entity = %msg.entity_id, added, "Installed op-keys from peer");
        }
        Ok(())
    }

    fn handle_entity_deleted(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let msg: EntityDeletedMsg = bincode::deserialize(data)?;
        let Some(pm) = self.entities.get(&msg.entity_id) else {
            return Ok(());
        };
        if msg.oplog.entity_id != msg.entity_id || !matches!(msg.oplog.op, OpKind::DeleteEntity) {
            return Err(EntityError::WrongScope {
                entity: msg.entity_id,
                category: LogCategory::Master,
            }
            .into());
        }
        pm.merge_oplogs(vec![msg.oplog])?;
        if pm.status() == EntityStatus::Deleted {
            info!(entity = %msg.entity_id, peer = %peer.id(), "Entity deleted by master");
            self.unregister_entity(&msg.entity_id);
        } else {
            debug!(entity = %msg.entity_id, "Deletion not authoritative yet");
        }
        Ok(())
    }

    fn handle_op_check_member(&self, peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let msg: OpCheckMemberMsg = bincode::deserialize(data)?;
        let pm = self
            .entities
            .get(&msg.entity_id)
            .ok_or(RouterError::UnknownEntity(msg.entity_id))?;
        let user = peer.user_id().ok_or(RouterError::UnexpectedMessage {
            code: CodeType::OpCheckMember,
            reason: "peer not identified".into(),
        })?;
        let reply = OpCheckMemberAckMsg {
            entity_id: msg.entity_id,
            oplog: pm.check_member(&user)?,
        };
        self.send_plain(peer, CodeType::OpCheckMemberAck, RouteHash::EMPTY, &reply)
    }

    fn handle_op_check_member_ack(&self, _peer: &Arc<Peer>, data: &[u8]) -> RouterResult<()> {
        let msg: OpCheckMemberAckMsg = bincode::deserialize(data)?;
        let pm = self
            .entities
            .get(&msg.entity_id)
            .ok_or(RouterError::UnknownEntity(msg.entity_id))?;
        let Some(oplog) = msg.oplog else {
            return Ok(());
        };
        if oplog.entity_id != msg.entity_id || oplog.category() != LogCategory::Member {
            return Err(EntityError::WrongScope {
                entity: msg.entity_id,
                category: LogCategory::Member,
            }
            .into());
        }
        let before = pm.record().log_id;
        pm.merge_oplogs(vec![oplog])?;
        self.after_merge(&pm, LogCategory::Member, before);
        Ok(())
    }

    /// Owner side of the join handshake
    fn handle_join(&self, peer: &Arc<Peer>, decoded: Decoded) -> RouterResult<()> {
        let entry = self
            .keys
            .join(&decoded.hash)
            .ok_or(RouterError::UnknownRouteHash(decoded.hash))?;
        let (op, payload) = decrypt(&decoded.data, &entry.key)?;
        let pm = self
            .entities
            .get(&entry.entity_id)
            .ok_or(RouterError::UnknownEntity(entry.entity_id))?;

        match JoinOp::from_u32(op) {
            Some(JoinOp::Request) => {
                let msg: JoinMsg = bincode::deserialize(&payload)?;
                if msg.entity_id != entry.entity_id {
                    return Err(RouterError::Join("join request names another entity".into()));
                }
                if !pm.is_important(&self.me.user_id()) {
                    return Err(RouterError::Join("not a master of this entity".into()));
                }
                if !msg.user_id.is_derived_from(&msg.public_key) {
                    self.send_join_reject(peer, &entry.key, "invalid user key")?;
                    return Err(RouterError::Join("user id does not match key".into()));
                }

                let now = Instant::now();
                let salt = random_bytes::<32>();
                let busy = {
                    let mut slots = lock(&self.join_slots);
                    match slots.get(&decoded.hash) {
                        Some(slot) if !slot.is_expired(now) && slot.peer != peer.id() => true,
                        _ => {
                            slots.insert(
                                decoded.hash,
                                JoinSlot {
                                    entity_id: entry.entity_id,
                                    peer: peer.id(),
                                    user_id: msg.user_id,
                                    public_key: msg.public_key,
                                    salt,
                                    deadline: now + self.config.handshake.join_timeout,
                                },
                            );
                            false
                        }
                    }
                };
                if busy {
                    self.send_join_reject(peer, &entry.key, "join key busy")?;
                    metrics::handshake("join", "busy");
                    return Err(RouterError::Join("join slot in use".into()));
                }
                debug!(entity = %entry.entity_id, peer = %peer.id(), "Join challenge sent");
                self.send_encrypted(
                    peer,
                    CodeType::JoinAck,
                    JoinAckOp::Challenge as u32,
                    &entry.key,
                    &JoinChallengeMsg { salt },
                )
            }
            Some(JoinOp::ChallengeAck) => {
                let msg: JoinEntityMsg = bincode::deserialize(&payload)?;
                let now = Instant::now();
                let slot = {
                    let mut slots = lock(&self.join_slots);
                    match slots.get(&decoded.hash) {
                        Some(slot) if slot.peer == peer.id() && !slot.is_expired(now) => {
                            slots.remove(&decoded.hash)
                        }
                        _ => None,
                    }
                }
                .ok_or_else(|| RouterError::Join("no outstanding join challenge".into()))?;

                if let Err(e) = slot.verify(&msg, &self.me.peer_id()) {
                    self.send_join_reject(peer, &entry.key, "bad proof")?;
                    metrics::handshake("join", "failed");
                    return Err(e);
                }

                let confirm = ConfirmJoin {
                    id: Uuid::new_v4(),
                    entity_id: slot.entity_id,
                    peer: peer.id(),
                    user_id: slot.user_id,
                    public_key: slot.public_key,
                    join_hash: decoded.hash,
                    deadline: now + self.config.handshake.join_timeout,
                };
                let id = confirm.id;
                lock(&self.confirm_joins).insert(id, confirm);
                self.send_encrypted(peer, CodeType::JoinAck, JoinAckOp::Pending as u32, &entry.key, &())?;
                info!(entity = %slot.entity_id, user = %slot.user_id, "Join verified");

                if self.config.handshake.auto_approve_join {
                    self.confirm_join(&id, true)?;
                }
                Ok(())
            }
            None => Err(RouterError::UnexpectedMessage {
                code: CodeType::Join,
                reason: format!("unknown join op {}", op),
            }),
        }
    }

    /// Requester side of the join handshake
    fn handle_join_ack(&self, peer: &Arc<Peer>, decoded: Decoded) -> RouterResult<()> {
        let (entity_id, key, owner) = {
            let requests = lock(&self.join_requests);
            let req = requests
                .get(&decoded.hash)
                .ok_or(RouterError::UnknownRouteHash(decoded.hash))?;
            (req.entity_id, req.join_key().clone(), req.owner)
        };
        if owner != peer.id() {
            return Err(RouterError::UnexpectedMessage {
                code: CodeType::JoinAck,
                reason: "join ack from a peer we did not ask".into(),
            });
        }
        let (op, payload) = decrypt(&decoded.data, &key)?;
        let hash = decoded.hash;

        match JoinAckOp::from_u32(op) {
            Some(JoinAckOp::Challenge) => {
                let msg: JoinChallengeMsg = bincode::deserialize(&payload)?;
                self.with_request(&hash, |r| r.on_challenge())?;
                let reply = answer_join_challenge(&self.me, &msg.salt, &entity_id, &owner);
                self.send_encrypted(peer, CodeType::Join, JoinOp::ChallengeAck as u32, &key, &reply)
            }
            Some(JoinAckOp::Pending) => self.with_request(&hash, |r| r.on_pending()),
            Some(JoinAckOp::Approve) => {
                let msg: JoinApproveMsg = bincode::deserialize(&payload)?;
                if msg.bundle.record.id != entity_id {
                    return Err(RouterError::Join("approval for another entity".into()));
                }
                let state = self.join_state(&hash);
                if !matches!(state, Some(JoinState::ChallengeAckSent | JoinState::AwaitingApproval)) {
                    return Err(RouterError::Join(format!("approval in state {:?}", state)));
                }
                let pm = Arc::new(EntityProtocolManager::from_join(
                    self.me.clone(),
                    self.storage.clone(),
                    self.entity_config.clone(),
                    msg.bundle,
                )?);
                self.with_request(&hash, |r| r.on_approved())?;
                self.register_entity(pm);
                metrics::handshake("join", "approved");
                info!(entity = %entity_id, "Joined entity");
                Ok(())
            }
            Some(JoinAckOp::Reject) => {
                let msg: JoinRejectMsg = bincode::deserialize(&payload)?;
                self.with_request(&hash, |r| r.on_rejected())?;
                info!(entity = %entity_id, reason = %msg.reason, "Join rejected");
                Ok(())
            }
            None => Err(RouterError::UnexpectedMessage {
                code: CodeType::JoinAck,
                reason: format!("unknown join ack op {}", op),
            }),
        }
    }

    fn with_request<F>(&self, hash: &RouteHash, f: F) -> RouterResult<()>
    where
        F: FnOnce(&mut JoinRequest) -> RouterResult<()>,
    {
        let mut requests = lock(&self.join_requests);
        let req = requests
            .get_mut(hash)
            .ok_or(RouterError::UnknownRouteHash(*hash))?;
        f(req)
    }

    // ---- housekeeping ----

    /// Expire handshakes and keys; retry identifies whose backoff elapsed
    pub fn housekeeping(&self, now: Instant) {
        let handshake = &self.config.handshake;

        let mut retries = Vec::new();
        {
            let mut sessions = lock(&self.identify);
            for (peer_id, session) in sessions.iter_mut() {
                if session.check_timeout(now, handshake.identify_backoff, handshake.identify_max_attempts) {
                    metrics::handshake("identify", "timeout");
                    debug!(peer = %peer_id, attempts = session.attempts(), "Identify timed out");
                }
                if session.retry_due(now) {
                    session.retry(now, handshake.identify_timeout);
                    retries.push(*peer_id);
                }
            }
        }
        for peer_id in retries {
            if let Some(peer) = self.peers.get(&peer_id) {
                if let Err(e) = self.send_identify_request(&peer) {
                    debug!(peer = %peer_id, error = %e, "Identify retry not sent");
                }
            }
        }

        let expired_slots = {
            let mut slots = lock(&self.join_slots);
            let before = slots.len();
            slots.retain(|_, s| !s.is_expired(now));
            before - slots.len()
        };
        if expired_slots > 0 {
            metrics::handshake("join", "expired");
            debug!(count = expired_slots, "Released expired join slots");
        }

        let mut unanswered = Vec::new();
        {
            let mut confirms = lock(&self.confirm_joins);
            let expired: Vec<Uuid> = confirms
                .values()
                .filter(|c| c.is_expired(now))
                .map(|c| c.id)
                .collect();
            for id in expired {
                unanswered.extend(confirms.remove(&id));
            }
        }
        for confirm in unanswered {
            metrics::handshake("join", "expired");
            debug!(entity = %confirm.entity_id, user = %confirm.user_id, "Dropped unanswered join");
            let (Some(peer), Some(entry)) = (self.peers.get(&confirm.peer), self.keys.join(&confirm.join_hash)) else {
                continue;
            };
            if let Err(e) = self.send_join_reject(&peer, &entry.key, "join confirmation expired") {
                debug!(peer = %confirm.peer, error = %e, "Join expiry notice not sent");
            }
        }

        {
            let mut requests = lock(&self.join_requests);
            for req in requests.values_mut() {
                if req.check_timeout(now) {
                    metrics::handshake("join", "timeout");
                    debug!(entity = %req.entity_id, "Join request expired");
                }
            }
            requests.retain(|_, req| !req.is_stale(now));
        }

        let ts = Timestamp::now();
        for pm in self.entities.all() {
            match pm.expire_op_keys(ts) {
                Ok(expired) if !expired.is_empty() => {
                    let mut tables = self.keys.write();
                    for key in &expired {
                        tables.remove_op_key(&key.route_hash());
                    }
                    debug!(entity = %pm.id(), count = expired.len(), "Dropped expired op-keys");
                }
                Ok(_) => {}
                Err(e) => warn!(entity = %pm.id(), error = %e, "Op-key expiry failed"),
            }
        }

        self.dial_history.purge_expired();
    }
}
