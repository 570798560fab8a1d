/*
    errors.rs - Error types for the storage collaborator

    Covers:
    - Backend I/O failures
    - Record encoding / decoding
    - Corrupted persisted state (fatal at startup)
*/

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A persisted record no longer decodes
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A lock guarding store state was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("oplog".to_string());
        assert_eq!(err.to_string(), "Not found: oplog");
    }

    #[test]
    fn test_bincode_error_conversion() {
        let err = bincode::deserialize::<u64>(&[1, 2]).unwrap_err();
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::Serialization(_)));
    }
}
