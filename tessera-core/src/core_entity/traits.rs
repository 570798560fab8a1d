//! Capabilities the router needs from entities and from the local user

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EntityInfo, EntityType};
use crate::core_identity::{MyIdentity, PeerId, UserId};
use crate::core_oplog::EntityId;

/// Priority class of a peer, lowest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerType {
    Random,
    Pending,
    Member,
    Important,
    Hub,
    Me,
}

impl PeerType {
    /// Highest priority first
    pub const BY_PRIORITY: [PeerType; 6] = [
        PeerType::Me,
        PeerType::Hub,
        PeerType::Important,
        PeerType::Member,
        PeerType::Pending,
        PeerType::Random,
    ];

    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Random => "random",
            PeerType::Pending => "pending",
            PeerType::Member => "member",
            PeerType::Important => "important",
            PeerType::Hub => "hub",
            PeerType::Me => "me",
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Entity: Send + Sync {
    fn id(&self) -> EntityId;

    fn entity_type(&self) -> EntityType;

    fn info(&self) -> EntityInfo;
}

/// Per-entity peer classification and bookkeeping
pub trait ProtocolManager: Send + Sync {
    fn is_my_device(&self, user: &UserId) -> bool;

    /// Masters of the entity
    fn is_important(&self, user: &UserId) -> bool;

    fn is_member(&self, user: &UserId) -> bool;

    /// Users whose membership or mastership is not yet approved
    fn is_pending(&self, user: &UserId) -> bool;

    /// How this entity ranks a user, `None` when it has no interest in them
    fn peer_type(&self, user: &UserId) -> Option<PeerType> {
        if self.is_my_device(user) {
            Some(PeerType::Me)
        } else if self.is_important(user) {
            Some(PeerType::Important)
        } else if self.is_member(user) {
            Some(PeerType::Member)
        } else if self.is_pending(user) {
            Some(PeerType::Pending)
        } else {
            None
        }
    }

    /// Returns false if the peer was already registered with the same type
    fn register_peer(&self, peer: PeerId, user: UserId, peer_type: PeerType) -> bool;

    fn unregister_peer(&self, peer: &PeerId) -> bool;

    fn registered_peers(&self) -> Vec<(PeerId, PeerType)>;
}

/// The local user as seen by the router
pub trait MyEntity: Send + Sync {
    fn identity(&self) -> &MyIdentity;

    fn user_id(&self) -> UserId {
        self.identity().user_id()
    }

    fn peer_id(&self) -> PeerId {
        self.identity().peer_id()
    }

    fn is_my_device(&self, user: &UserId) -> bool {
        *user == self.user_id()
    }
}

impl MyEntity for MyIdentity {
    fn identity(&self) -> &MyIdentity {
        self
    }
}
