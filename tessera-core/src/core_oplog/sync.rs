//! Anti-entropy messages and the Merkle descent
//!
//! Both sides run the same step: compare the nodes the peer sent with our own
//! nodes over the same ranges, then either stop (in sync), send our nodes one
//! level down for the divergent buckets, or at hour level exchange the oplogs.

use serde::{Deserialize, Serialize};

use super::merkle::{diff_nodes, KeyRange, MerkleLevel, MerkleNode, MerkleTree};
use super::oplog::Oplog;
use super::types::LogCategory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Our nodes of `level` inside `ranges` (`None` means the root)
    Merkle {
        category: LogCategory,
        level: MerkleLevel,
        ranges: Option<Vec<KeyRange>>,
        nodes: Vec<MerkleNode>,
    },
    /// Oplog records. `request` asks for our peer's records in those hour buckets.
    OplogData {
        category: LogCategory,
        oplogs: Vec<Oplog>,
        request: Vec<u64>,
    },
    /// Oplogs waiting for master signatures
    PendingOplog {
        category: LogCategory,
        oplogs: Vec<Oplog>,
    },
    /// The same oplogs with whatever signatures the receiver could add
    PendingOplogAck {
        category: LogCategory,
        oplogs: Vec<Oplog>,
    },
}

impl SyncMessage {
    pub fn category(&self) -> LogCategory {
        match self {
            SyncMessage::Merkle { category, .. }
            | SyncMessage::OplogData { category, .. }
            | SyncMessage::PendingOplog { category, .. }
            | SyncMessage::PendingOplogAck { category, .. } => *category,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Merkle { .. } => "merkle",
            SyncMessage::OplogData { .. } => "oplog_data",
            SyncMessage::PendingOplog { .. } => "pending",
            SyncMessage::PendingOplogAck { .. } => "pending_ack",
        }
    }
}

/// Next move of a Merkle exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    InSync,
    Descend {
        level: MerkleLevel,
        ranges: Vec<KeyRange>,
        nodes: Vec<MerkleNode>,
    },
    /// Hour buckets that differ; exchange their oplogs
    Exchange { buckets: Vec<u64> },
}

/// First message of a round: our root
pub fn start_round(tree: &MerkleTree, category: LogCategory) -> SyncMessage {
    SyncMessage::Merkle {
        category,
        level: MerkleLevel::Root,
        ranges: None,
        nodes: vec![tree.root()],
    }
}

/// Compare the peer's nodes with ours and decide how to continue
pub fn respond(
    tree: &MerkleTree,
    level: MerkleLevel,
    ranges: Option<&[KeyRange]>,
    theirs: &[MerkleNode],
) -> SyncStep {
    let mine = match ranges {
        None => vec![tree.root()],
        Some(ranges) => tree.nodes_in_ranges(level, ranges),
    };
    // an empty root compares by content, not presence
    let mine: Vec<MerkleNode> = mine.into_iter().filter(|n| n.count > 0).collect();
    let theirs: Vec<MerkleNode> = theirs
        .iter()
        .filter(|n| n.level == level && n.count > 0)
        .copied()
        .collect();

    let divergent = diff_nodes(&mine, &theirs);
    if divergent.is_empty() {
        return SyncStep::InSync;
    }

    match level.child() {
        None => SyncStep::Exchange { buckets: divergent },
        Some(child) => {
            let ranges: Vec<KeyRange> = divergent
                .iter()
                .map(|&start| (start, start.saturating_add(level.width())))
                .collect();
            let nodes = tree.nodes_in_ranges(child, &ranges);
            SyncStep::Descend {
                level: child,
                ranges,
                nodes,
            }
        }
    }
}

/// Split oplogs into messages of at most `batch_size` records.
/// `request` rides on the last chunk so the peer answers once it has everything.
pub fn chunk_oplogs(
    category: LogCategory,
    oplogs: Vec<Oplog>,
    request: Vec<u64>,
    batch_size: usize,
) -> Vec<SyncMessage> {
    let batch_size = batch_size.max(1);
    let mut chunks: Vec<Vec<Oplog>> = Vec::new();
    let mut iter = oplogs.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(batch_size).collect());
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, oplogs)| SyncMessage::OplogData {
            category,
            oplogs,
            request: if i == last { request.clone() } else { Vec::new() },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::UserId;
    use crate::core_oplog::oplog::OpKind;
    use crate::core_oplog::types::{EntityId, LogId, Status, Timestamp};

    /// Walk two trees down to the divergent hour buckets the way two peers would
    fn converge(a: &MerkleTree, b: &MerkleTree) -> Option<Vec<u64>> {
        let SyncMessage::Merkle { nodes, .. } = start_round(a, LogCategory::Object) else {
            unreachable!()
        };
        let (mut level, mut ranges, mut nodes) = (MerkleLevel::Root, None::<Vec<KeyRange>>, nodes);
        let trees = [b, a];
        let mut turn = 0;
        loop {
            match respond(trees[turn % 2], level, ranges.as_deref(), &nodes) {
                SyncStep::InSync => return None,
                SyncStep::Exchange { buckets } => return Some(buckets),
                SyncStep::Descend { level: l, ranges: r, nodes: n } => {
                    level = l;
                    ranges = Some(r);
                    nodes = n;
                }
            }
            turn += 1;
        }
    }

    #[test]
    fn test_identical_trees_in_sync() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for i in 0..5 {
            let id = LogId::new(Timestamp::from_secs(1_700_000_000 + i * 86_400));
            a.insert(&id, Status::Alive);
            b.insert(&id, Status::Alive);
        }
        assert_eq!(converge(&a, &b), None);
        assert_eq!(converge(&MerkleTree::new(), &MerkleTree::new()), None);
    }

    #[test]
    fn test_descent_finds_single_bucket() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for i in 0..50 {
            let id = LogId::new(Timestamp::from_secs(1_600_000_000 + i * 40_000));
            a.insert(&id, Status::Alive);
            b.insert(&id, Status::Alive);
        }
        let extra = LogId::new(Timestamp::from_secs(1_600_000_000 + 7 * 40_000 + 5));
        b.insert(&extra, Status::Alive);

        let buckets = converge(&a, &b).unwrap();
        assert_eq!(
            buckets,
            vec![MerkleLevel::Hour.bucket_start(extra.timestamp().as_micros())]
        );
    }

    #[test]
    fn test_empty_side_gets_everything() {
        let mut a = MerkleTree::new();
        let id = LogId::new(Timestamp::from_secs(1_650_000_000));
        a.insert(&id, Status::Alive);
        let buckets = converge(&MerkleTree::new(), &a).unwrap();
        assert_eq!(buckets.len(), 1);
    }

    #[test]
    fn test_descent_reaches_oplog_near_year_boundary() {
        let day = |d: u64| LogId::new(Timestamp::from_secs(d * 86_400));
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        let shared = day(20_000);
        a.insert(&shared, Status::Alive);
        b.insert(&shared, Status::Alive);
        // days close to a year boundary, one of them in a year's last month
        let extras = [day(20_442), day(20_512)];
        for id in &extras {
            b.insert(id, Status::Alive);
        }
        assert_ne!(a.root(), b.root());

        let buckets = converge(&a, &b).unwrap();
        let expected: Vec<u64> = extras
            .iter()
            .map(|id| MerkleLevel::Hour.bucket_start(id.timestamp().as_micros()))
            .collect();
        assert_eq!(buckets, expected);
        // and from the other side
        assert_eq!(converge(&b, &a).unwrap(), buckets);
    }

    #[test]
    fn test_chunking_puts_request_last() {
        let oplogs: Vec<Oplog> = (0..5)
            .map(|i| {
                Oplog::new(
                    EntityId::new(),
                    OpKind::DeleteEntity,
                    UserId::from_bytes([0u8; 32]),
                    Timestamp::from_secs(i),
                )
            })
            .collect();
        let msgs = chunk_oplogs(LogCategory::Master, oplogs, vec![42], 2);
        assert_eq!(msgs.len(), 3);
        match (&msgs[0], &msgs[2]) {
            (
                SyncMessage::OplogData { request: first, oplogs: a, .. },
                SyncMessage::OplogData { request: last, oplogs: c, .. },
            ) => {
                assert!(first.is_empty());
                assert_eq!(last, &vec![42]);
                assert_eq!(a.len(), 2);
                assert_eq!(c.len(), 1);
            }
            _ => panic!("unexpected message"),
        }

        let empty = chunk_oplogs(LogCategory::Master, Vec::new(), vec![1], 10);
        assert_eq!(empty.len(), 1);
    }
}
