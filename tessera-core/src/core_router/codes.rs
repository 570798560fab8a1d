//! Transport message codes and the sub-op tags carried inside encrypted payloads

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_oplog::SyncMessage;

/// Top-level code of a wire message
///
/// Codes below [`CodeType::RequireHash`] travel under an op-key or join-key and
/// carry that key's routing hash; the receiver checks the inner hash against it.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodeType {
    Join = 1,
    JoinAck = 2,
    Op = 3,
    OpFail = 4,
    RequireHash = 5,
    RequestOpKey = 6,
    RequestOpKeyFail = 7,
    RequestOpKeyAck = 8,
    EntityDeleted = 9,
    OpCheckMember = 10,
    OpCheckMemberAck = 11,
    IdentifyPeer = 12,
    IdentifyPeerFail = 13,
    IdentifyPeerWithMyId = 14,
    IdentifyPeerWithMyIdChallenge = 15,
    IdentifyPeerWithMyIdChallengeAck = 16,
    IdentifyPeerWithMyIdAck = 17,
}

impl CodeType {
    pub fn from_u64(code: u64) -> Option<Self> {
        let code = match code {
            1 => CodeType::Join,
            2 => CodeType::JoinAck,
            3 => CodeType::Op,
            4 => CodeType::OpFail,
            5 => CodeType::RequireHash,
            6 => CodeType::RequestOpKey,
            7 => CodeType::RequestOpKeyFail,
            8 => CodeType::RequestOpKeyAck,
            9 => CodeType::EntityDeleted,
            10 => CodeType::OpCheckMember,
            11 => CodeType::OpCheckMemberAck,
            12 => CodeType::IdentifyPeer,
            13 => CodeType::IdentifyPeerFail,
            14 => CodeType::IdentifyPeerWithMyId,
            15 => CodeType::IdentifyPeerWithMyIdChallenge,
            16 => CodeType::IdentifyPeerWithMyIdChallengeAck,
            17 => CodeType::IdentifyPeerWithMyIdAck,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Whether the envelope hash must match the one inside the event
    pub fn requires_hash(self) -> bool {
        self < CodeType::RequireHash
    }

    pub fn is_identify(self) -> bool {
        self >= CodeType::IdentifyPeer
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodeType::Join => "join",
            CodeType::JoinAck => "join_ack",
            CodeType::Op => "op",
            CodeType::OpFail => "op_fail",
            CodeType::RequireHash => "require_hash",
            CodeType::RequestOpKey => "request_op_key",
            CodeType::RequestOpKeyFail => "request_op_key_fail",
            CodeType::RequestOpKeyAck => "request_op_key_ack",
            CodeType::EntityDeleted => "entity_deleted",
            CodeType::OpCheckMember => "op_check_member",
            CodeType::OpCheckMemberAck => "op_check_member_ack",
            CodeType::IdentifyPeer => "identify_peer",
            CodeType::IdentifyPeerFail => "identify_peer_fail",
            CodeType::IdentifyPeerWithMyId => "identify_with_my_id",
            CodeType::IdentifyPeerWithMyIdChallenge => "identify_challenge",
            CodeType::IdentifyPeerWithMyIdChallengeAck => "identify_challenge_ack",
            CodeType::IdentifyPeerWithMyIdAck => "identify_ack",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-op of an `Op` message, one per sync message kind
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    SyncMerkle = 1,
    SyncOplogData = 2,
    SyncPendingOplog = 3,
    SyncPendingOplogAck = 4,
}

impl OpType {
    pub fn of(message: &SyncMessage) -> Self {
        match message {
            SyncMessage::Merkle { .. } => OpType::SyncMerkle,
            SyncMessage::OplogData { .. } => OpType::SyncOplogData,
            SyncMessage::PendingOplog { .. } => OpType::SyncPendingOplog,
            SyncMessage::PendingOplogAck { .. } => OpType::SyncPendingOplogAck,
        }
    }
}

/// Sub-op of a `Join` message (requester → owner)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    Request = 1,
    ChallengeAck = 2,
}

impl JoinOp {
    pub fn from_u32(op: u32) -> Option<Self> {
        match op {
            1 => Some(JoinOp::Request),
            2 => Some(JoinOp::ChallengeAck),
            _ => None,
        }
    }
}

/// Sub-op of a `JoinAck` message (owner → requester)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAckOp {
    Challenge = 1,
    /// Challenge answered, approval outstanding
    Pending = 2,
    Approve = 3,
    Reject = 4,
}

impl JoinAckOp {
    pub fn from_u32(op: u32) -> Option<Self> {
        match op {
            1 => Some(JoinAckOp::Challenge),
            2 => Some(JoinAckOp::Pending),
            3 => Some(JoinAckOp::Approve),
            4 => Some(JoinAckOp::Reject),
            _ => None,
        }
    }
}
