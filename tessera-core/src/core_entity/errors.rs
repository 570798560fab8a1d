//! Entity error types

use thiserror::Error;

use crate::core_identity::{PeerId, UserId};
use crate::core_oplog::{EntityId, LogCategory, ObjectId, OplogError};
use crate::core_store::StoreError;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Entity {0} is deleted")]
    Deleted(EntityId),

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("User {0} is not an approved master")]
    NotMaster(UserId),

    #[error("User {0} is not a member")]
    NotMember(UserId),

    #[error("Peer {0} is not registered with this entity")]
    PeerNotRegistered(PeerId),

    #[error("Oplog does not belong to {entity}/{category}")]
    WrongScope {
        entity: EntityId,
        category: LogCategory,
    },

    #[error("Invalid join bundle: {0}")]
    InvalidBundle(String),
}

pub type EntityResult<T> = Result<T, EntityError>;

impl From<bincode::Error> for EntityError {
    fn from(err: bincode::Error) -> Self {
        EntityError::Oplog(OplogError::from(err))
    }
}
