//! Oplog replication engine
//!
//! Every entity keeps one append-only oplog per category, each with its own
//! Merkle tree. Peers diff the trees level by level and exchange only the hour
//! buckets that disagree.

pub mod errors;
pub mod merge;
pub mod merkle;
pub mod oplog;
pub mod store;
pub mod sync;
pub mod types;

pub use errors::{OplogError, OplogResult};
pub use merge::{advance_status, wins, MergeOutcome, OrderKey};
pub use merkle::{diff_nodes, KeyRange, MerkleLevel, MerkleNode, MerkleTree};
pub use oplog::{OpKind, Oplog, SignInfo};
pub use store::{OplogChange, OplogStore};
pub use sync::{chunk_oplogs, respond, start_round, SyncMessage, SyncStep};
pub use types::{EntityId, ListOrder, LogCategory, LogId, ObjectId, Status, Timestamp};
