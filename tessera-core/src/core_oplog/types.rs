//! Identifiers, timestamps and statuses shared by every oplog category

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::core_identity::random_bytes;

/// Microseconds since the Unix epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs * 1_000_000)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as u64))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Time-ordered unique oplog id: 8 bytes big-endian timestamp, 8 random bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId([u8; 16]);

impl LogId {
    pub fn new(ts: Timestamp) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&ts.as_micros().to_be_bytes());
        bytes[8..].copy_from_slice(&random_bytes::<8>());
        LogId(bytes)
    }

    /// Smallest id carrying `ts`, for range starts
    pub fn floor(ts: Timestamp) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&ts.as_micros().to_be_bytes());
        LogId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        LogId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn timestamp(&self) -> Timestamp {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.0[..8]);
        Timestamp::from_micros(u64::from_be_bytes(ts))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        EntityId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        ObjectId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Oplog lifecycle. The derived order is the status rank used by the tie-break:
/// a record may only move up, and `Failed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Received but rejected by validation; never retried
    Failed,
    /// Created locally, not yet synced
    Internal,
    /// Waiting for enough master signatures
    Pending,
    Alive,
    Deleted,
}

impl Status {
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// Alive or Deleted: counted by the Merkle tree and exchanged by anti-entropy
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Status::Alive | Status::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Failed => "failed",
            Status::Internal => "internal",
            Status::Pending => "pending",
            Status::Alive => "alive",
            Status::Deleted => "deleted",
        }
    }
}

/// Oplog categories kept per entity; each has its own store and Merkle tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    Master,
    Member,
    OpKey,
    Object,
}

impl LogCategory {
    /// Sync order: master information first so later categories can validate
    pub const ALL: [LogCategory; 4] = [
        LogCategory::Master,
        LogCategory::Member,
        LogCategory::OpKey,
        LogCategory::Object,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Master => "master",
            LogCategory::Member => "member",
            LogCategory::OpKey => "opkey",
            LogCategory::Object => "object",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            LogCategory::Master => b'm',
            LogCategory::Member => b'u',
            LogCategory::OpKey => b'k',
            LogCategory::Object => b'o',
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListOrder {
    /// Ascending from the start id
    Next,
    /// Descending from the start id
    Prev,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_orders_by_time() {
        let early = LogId::new(Timestamp::from_secs(10));
        let late = LogId::new(Timestamp::from_secs(11));
        assert!(early < late);
        assert_eq!(early.timestamp(), Timestamp::from_secs(10));
        assert!(LogId::floor(Timestamp::from_secs(10)) <= early);
    }

    #[test]
    fn test_status_rank_is_monotone_order() {
        assert!(Status::Failed < Status::Internal);
        assert!(Status::Internal < Status::Pending);
        assert!(Status::Pending < Status::Alive);
        assert!(Status::Alive < Status::Deleted);
        assert!(Status::Alive.is_authoritative());
        assert!(!Status::Pending.is_authoritative());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_secs(1);
        assert_eq!(ts.saturating_add(Duration::from_millis(1)).as_micros(), 1_001_000);
        assert!(Timestamp::ZERO.is_zero());
    }
}
