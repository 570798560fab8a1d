//! Oplog error types

use thiserror::Error;

use super::types::LogId;
use crate::core_store::StoreError;

#[derive(Debug, Error)]
pub enum OplogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Oplog {0} is missing its creator signature")]
    Unsigned(LogId),

    #[error("Oplog {id} has an invalid signature: {reason}")]
    InvalidSignature { id: LogId, reason: String },

    #[error("Oplog {id} belongs to another entity")]
    EntityMismatch { id: LogId },

    #[error("Oplog {id} is in the wrong category: {reason}")]
    WrongCategory { id: LogId, reason: String },

    #[error("Oplog not found: {0}")]
    NotFound(LogId),
}

pub type OplogResult<T> = Result<T, OplogError>;

impl From<bincode::Error> for OplogError {
    fn from(err: bincode::Error) -> Self {
        OplogError::Encoding(err.to_string())
    }
}
