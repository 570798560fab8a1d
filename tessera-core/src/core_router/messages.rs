//! Payloads of the key-exchange and membership codes
//!
//! These travel as plain bincode inside the envelope; they are only ever sent
//! to peers already classified for the entity in question.

use serde::{Deserialize, Serialize};

use crate::core_entity::KeyInfo;
use crate::core_oplog::{EntityId, Oplog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOpKeyMsg {
    pub entity_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOpKeyAckMsg {
    pub entity_id: EntityId,
    pub keys: Vec<KeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOpKeyFailMsg {
    pub entity_id: EntityId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDeletedMsg {
    pub entity_id: EntityId,
    pub oplog: Oplog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCheckMemberMsg {
    pub entity_id: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpCheckMemberAckMsg {
    pub entity_id: EntityId,
    /// Winning member-oplog about the asker, if any
    pub oplog: Option<Oplog>,
}
