/*
    errors.rs - Router error types

    Every error a peer loop can see maps onto one ErrorClass:

        Protocol      -> malformed / oversize / mismatched message, drop it
        Admission     -> capacity or duplicate identity, peer not registered
        Validation    -> bad oplog signature or chain, recorded as Failed
        TransientSync -> round aborted, next timer tick resumes
        Fatal         -> local state corrupted, abort startup

    Only transport failures end a peer loop; they never reach ErrorClass.
*/

use thiserror::Error;

use super::codes::CodeType;
use crate::core_entity::{EntityError, PeerType, RouteHash};
use crate::core_identity::{PeerId, UserId};
use crate::core_oplog::{EntityId, OplogError};
use crate::core_store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope checksum mismatch")]
    ChecksumMismatch,

    #[error("Envelope addressed to another node")]
    NotForMe,

    #[error("Unknown message code: {0}")]
    InvalidMsgCode(u64),

    /// Inner code or routing hash disagrees with the envelope
    #[error("Envelope hash mismatch")]
    HashMismatch,

    #[error("Message too large: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed")]
    Decrypt,

    #[error("Invalid padding")]
    Padding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("User {0} is already registered on another peer")]
    AlreadyRegistered(UserId),

    #[error("Too many {0} peers")]
    TooManyPeers(PeerType),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Admission,
    Validation,
    TransientSync,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Protocol => "protocol",
            ErrorClass::Admission => "admission",
            ErrorClass::Validation => "validation",
            ErrorClass::TransientSync => "transient_sync",
            ErrorClass::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("No key registered for route hash {0}")]
    UnknownRouteHash(RouteHash),

    #[error("Entity not registered: {0}")]
    UnknownEntity(EntityId),

    #[error("Peer not connected: {0}")]
    PeerNotFound(PeerId),

    #[error("Entity {0} has no usable op-key")]
    NoOpKey(EntityId),

    #[error("Unexpected {code} message: {reason}")]
    UnexpectedMessage { code: CodeType, reason: String },

    #[error("Identify failed: {0}")]
    Identify(String),

    #[error("Join failed: {0}")]
    Join(String),

    #[error("Outbound queue of peer {0} is full")]
    QueueFull(PeerId),

    #[error("Peer {0} is closed")]
    PeerClosed(PeerId),
}

pub type RouterResult<T> = Result<T, RouterError>;

impl From<bincode::Error> for RouterError {
    fn from(err: bincode::Error) -> Self {
        RouterError::Encoding(err.to_string())
    }
}

impl RouterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RouterError::Codec(_)
            | RouterError::Encoding(_)
            | RouterError::UnknownRouteHash(_)
            | RouterError::UnexpectedMessage { .. }
            | RouterError::Identify(_)
            | RouterError::Join(_) => ErrorClass::Protocol,
            RouterError::Admission(_) => ErrorClass::Admission,
            RouterError::Entity(err) => entity_class(err),
            RouterError::Transport(_)
            | RouterError::UnknownEntity(_)
            | RouterError::PeerNotFound(_)
            | RouterError::NoOpKey(_)
            | RouterError::QueueFull(_)
            | RouterError::PeerClosed(_) => ErrorClass::TransientSync,
        }
    }
}

fn store_class(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Corrupted(_) => ErrorClass::Fatal,
        _ => ErrorClass::TransientSync,
    }
}

fn entity_class(err: &EntityError) -> ErrorClass {
    match err {
        EntityError::Store(e) => store_class(e),
        EntityError::Oplog(OplogError::Store(e)) => store_class(e),
        EntityError::Oplog(OplogError::Encoding(_)) => ErrorClass::Protocol,
        EntityError::Oplog(_)
        | EntityError::NotMaster(_)
        | EntityError::NotMember(_)
        | EntityError::WrongScope { .. }
        | EntityError::InvalidBundle(_) => ErrorClass::Validation,
        EntityError::PeerNotRegistered(_) => ErrorClass::Protocol,
        EntityError::NotFound(_) | EntityError::Deleted(_) | EntityError::ObjectNotFound(_) => {
            ErrorClass::TransientSync
        }
    }
}
