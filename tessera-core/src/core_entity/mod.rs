//! Entities and their protocol managers
//!
//! An entity is a replicated unit of shared state (profile, friend link, group).
//! Its `EntityProtocolManager` owns the oplog stores, derives the master set,
//! classifies peers for this entity and produces the sync traffic for them.

pub mod consensus;
pub mod errors;
pub mod keys;
mod protocol_manager;
mod registry;
pub mod traits;

pub use consensus::{ApproveJoin, MasterSet, Verdict};
pub use errors::{EntityError, EntityResult};
pub use keys::{KeyInfo, KeyKind, RouteHash, ROUTE_HASH_LEN};
pub use protocol_manager::{EntityConfig, EntityProtocolManager};
pub use registry::EntityRegistry;
pub use traits::{Entity, MyEntity, PeerType, ProtocolManager};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_identity::UserId;
use crate::core_oplog::{EntityId, LogId, ObjectId, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Profile,
    Friend,
    Group,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Profile => "profile",
            EntityType::Friend => "friend",
            EntityType::Group => "group",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Record written, bootstrap oplogs not applied yet
    Init,
    /// Joined, waiting for master information to validate our membership
    Pending,
    Alive,
    /// Deleted by a master
    Deleted,
    /// We were removed from the entity
    Terminated,
}

impl EntityStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Terminated)
    }
}

/// Persisted entity header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub creator_id: UserId,
    pub update_ts: Timestamp,
    /// Last applied oplog
    pub log_id: Option<LogId>,
}

/// Snapshot of an entity for callers outside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub creator_id: UserId,
    pub owner_ids: Vec<UserId>,
    pub update_ts: Timestamp,
    pub log_id: Option<LogId>,
}

/// An entity-owned item carried by object oplogs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub entity_id: EntityId,
    pub data: Vec<u8>,
    pub creator_id: UserId,
    pub update_ts: Timestamp,
    /// Oplog that produced this version
    pub log_id: LogId,
    pub deleted: bool,
}
