//! Time-bucketed Merkle tree for oplog anti-entropy
//!
//! Each authoritative oplog contributes `blake3(log_id ‖ status)` to one bucket per
//! level. A node's hash is the XOR of its contributions, so inserts and status
//! changes update the five affected nodes in place. The tree lives in memory and is
//! rebuilt from the oplog store on load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

use super::types::{ListOrder, LogId, Status};

const HOUR: u64 = 3_600 * 1_000_000;
const DAY: u64 = 24 * HOUR;
const MONTH: u64 = 30 * DAY;
/// Twelve months, so every month bucket lies inside one year bucket
const YEAR: u64 = 12 * MONTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MerkleLevel {
    Hour,
    Day,
    Month,
    Year,
    Root,
}

impl MerkleLevel {
    pub const ALL: [MerkleLevel; 5] = [
        MerkleLevel::Hour,
        MerkleLevel::Day,
        MerkleLevel::Month,
        MerkleLevel::Year,
        MerkleLevel::Root,
    ];

    /// Bucket width in microseconds
    pub fn width(&self) -> u64 {
        match self {
            MerkleLevel::Hour => HOUR,
            MerkleLevel::Day => DAY,
            MerkleLevel::Month => MONTH,
            MerkleLevel::Year => YEAR,
            MerkleLevel::Root => u64::MAX,
        }
    }

    pub fn bucket_start(&self, micros: u64) -> u64 {
        match self {
            MerkleLevel::Root => 0,
            level => micros - micros % level.width(),
        }
    }

    /// The next finer level, `None` at the leaves
    pub fn child(&self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Hour => None,
            MerkleLevel::Day => Some(MerkleLevel::Hour),
            MerkleLevel::Month => Some(MerkleLevel::Day),
            MerkleLevel::Year => Some(MerkleLevel::Month),
            MerkleLevel::Root => Some(MerkleLevel::Year),
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Time range `[start, end)` in microseconds
pub type KeyRange = (u64, u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: MerkleLevel,
    /// Bucket start in microseconds
    pub start: u64,
    pub hash: [u8; 32],
    pub count: u32,
}

impl MerkleNode {
    pub fn range(&self) -> KeyRange {
        (self.start, self.start.saturating_add(self.level.width()))
    }

    fn same_content(&self, other: &MerkleNode) -> bool {
        self.hash == other.hash && self.count == other.count
    }
}

#[derive(Debug)]
pub struct MerkleTree {
    levels: [BTreeMap<u64, MerkleNode>; 5],
    root_changed_at: Instant,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

fn leaf(id: &LogId, status: Status) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(&[status.rank()]);
    *hasher.finalize().as_bytes()
}

fn xor_into(acc: &mut [u8; 32], other: &[u8; 32]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree {
            levels: Default::default(),
            root_changed_at: Instant::now(),
        }
    }

    /// Index an oplog. Non-authoritative statuses are ignored.
    pub fn insert(&mut self, id: &LogId, status: Status) {
        if status.is_authoritative() {
            self.apply(id, status, true);
        }
    }

    pub fn remove(&mut self, id: &LogId, status: Status) {
        if status.is_authoritative() {
            self.apply(id, status, false);
        }
    }

    /// Move an indexed oplog from one status to another
    pub fn update(&mut self, id: &LogId, from: Option<Status>, to: Status) {
        if from == Some(to) {
            return;
        }
        if let Some(from) = from {
            self.remove(id, from);
        }
        self.insert(id, to);
    }

    fn apply(&mut self, id: &LogId, status: Status, add: bool) {
        let contribution = leaf(id, status);
        let micros = id.timestamp().as_micros();
        for level in MerkleLevel::ALL {
            let start = level.bucket_start(micros);
            let nodes = &mut self.levels[level.index()];
            let node = nodes.entry(start).or_insert(MerkleNode {
                level,
                start,
                hash: [0u8; 32],
                count: 0,
            });
            xor_into(&mut node.hash, &contribution);
            if add {
                node.count += 1;
            } else {
                node.count = node.count.saturating_sub(1);
            }
            if node.count == 0 {
                nodes.remove(&start);
            }
        }
        self.root_changed_at = Instant::now();
    }

    pub fn root(&self) -> MerkleNode {
        self.levels[MerkleLevel::Root.index()]
            .get(&0)
            .copied()
            .unwrap_or(MerkleNode {
                level: MerkleLevel::Root,
                start: 0,
                hash: [0u8; 32],
                count: 0,
            })
    }

    pub fn len(&self) -> usize {
        self.root().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How long the root hash has been unchanged
    pub fn root_stable_for(&self) -> Duration {
        self.root_changed_at.elapsed()
    }

    /// Restart the quiet period, used after a forced sync
    pub fn touch(&mut self) {
        self.root_changed_at = Instant::now();
    }

    /// Up to `limit` nodes of `level` starting at `start_key` in the given order
    pub fn get_merkle_node_list(
        &self,
        level: MerkleLevel,
        start_key: Option<u64>,
        limit: usize,
        order: ListOrder,
    ) -> Vec<MerkleNode> {
        let nodes = &self.levels[level.index()];
        match (order, start_key) {
            (ListOrder::Next, Some(start)) => nodes.range(start..).map(|(_, n)| *n).take(limit).collect(),
            (ListOrder::Next, None) => nodes.values().copied().take(limit).collect(),
            (ListOrder::Prev, Some(start)) => {
                nodes.range(..=start).rev().map(|(_, n)| *n).take(limit).collect()
            }
            (ListOrder::Prev, None) => nodes.values().rev().copied().take(limit).collect(),
        }
    }

    /// Every node of `level` whose bucket start lies in one of `ranges`
    pub fn nodes_in_ranges(&self, level: MerkleLevel, ranges: &[KeyRange]) -> Vec<MerkleNode> {
        let nodes = &self.levels[level.index()];
        let mut out = Vec::new();
        for &(start, end) in ranges.iter().filter(|(s, e)| s < e) {
            out.extend(nodes.range(start..end).map(|(_, n)| *n));
        }
        out
    }
}

/// Bucket starts where two node lists disagree, including buckets only one side has
pub fn diff_nodes(mine: &[MerkleNode], theirs: &[MerkleNode]) -> Vec<u64> {
    let mine: BTreeMap<u64, &MerkleNode> = mine.iter().map(|n| (n.start, n)).collect();
    let theirs: BTreeMap<u64, &MerkleNode> = theirs.iter().map(|n| (n.start, n)).collect();

    let mut keys: Vec<u64> = mine.keys().chain(theirs.keys()).copied().collect();
    keys.sort_unstable();
    keys.dedup();
    keys.into_iter()
        .filter(|k| match (mine.get(k), theirs.get(k)) {
            (Some(a), Some(b)) => !a.same_content(b),
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_oplog::types::Timestamp;

    fn id_at(secs: u64) -> LogId {
        LogId::new(Timestamp::from_secs(secs))
    }

    #[test]
    fn test_insert_order_does_not_matter() {
        let ids: Vec<LogId> = (0..20).map(|i| id_at(1_700_000_000 + i * 5_000)).collect();

        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for id in &ids {
            a.insert(id, Status::Alive);
        }
        for id in ids.iter().rev() {
            b.insert(id, Status::Alive);
        }

        assert_eq!(a.root(), b.root());
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_remove_restores_previous_root() {
        let mut tree = MerkleTree::new();
        let first = id_at(1_700_000_000);
        tree.insert(&first, Status::Alive);
        let before = tree.root();

        let second = id_at(1_700_000_100);
        tree.insert(&second, Status::Alive);
        assert_ne!(tree.root(), before);

        tree.remove(&second, Status::Alive);
        assert_eq!(tree.root(), before);
    }

    #[test]
    fn test_status_change_changes_hash() {
        let mut tree = MerkleTree::new();
        let id = id_at(1_700_000_000);
        tree.insert(&id, Status::Alive);
        let alive = tree.root();

        tree.update(&id, Some(Status::Alive), Status::Deleted);
        assert_ne!(tree.root().hash, alive.hash);
        assert_eq!(tree.root().count, 1);
    }

    #[test]
    fn test_non_authoritative_ignored() {
        let mut tree = MerkleTree::new();
        tree.insert(&id_at(1), Status::Pending);
        tree.insert(&id_at(2), Status::Failed);
        assert!(tree.is_empty());

        // pending -> alive adds the leaf once
        let id = id_at(3);
        tree.update(&id, Some(Status::Pending), Status::Alive);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_diff_localizes_to_hour_bucket() {
        let base = 1_700_000_000;
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for i in 0..10 {
            let id = id_at(base + i * 3_600);
            a.insert(&id, Status::Alive);
            b.insert(&id, Status::Alive);
        }
        let extra = id_at(base + 4 * 3_600 + 10);
        a.insert(&extra, Status::Alive);

        let hours_a = a.get_merkle_node_list(MerkleLevel::Hour, None, usize::MAX, ListOrder::Next);
        let hours_b = b.get_merkle_node_list(MerkleLevel::Hour, None, usize::MAX, ListOrder::Next);
        let diff = diff_nodes(&hours_a, &hours_b);

        assert_eq!(diff, vec![MerkleLevel::Hour.bucket_start(extra.timestamp().as_micros())]);
    }

    #[test]
    fn test_node_list_order_and_limit() {
        let mut tree = MerkleTree::new();
        for i in 0..5 {
            tree.insert(&id_at(i * 3_600), Status::Alive);
        }
        let next = tree.get_merkle_node_list(MerkleLevel::Hour, Some(HOUR), 2, ListOrder::Next);
        assert_eq!(next.iter().map(|n| n.start).collect::<Vec<_>>(), vec![HOUR, 2 * HOUR]);

        let prev = tree.get_merkle_node_list(MerkleLevel::Hour, Some(HOUR), 5, ListOrder::Prev);
        assert_eq!(prev.iter().map(|n| n.start).collect::<Vec<_>>(), vec![HOUR, 0]);

        let ranged = tree.nodes_in_ranges(MerkleLevel::Hour, &[(0, DAY)]);
        assert_eq!(ranged.len(), 5);
    }

    #[test]
    fn test_buckets_nest_inside_parents() {
        for level in MerkleLevel::ALL {
            let Some(child) = level.child() else {
                continue;
            };
            if level != MerkleLevel::Root {
                assert_eq!(level.width() % child.width(), 0, "{:?}", level);
            }
            // a child bucket never starts before its parent's bucket
            for day in [0u64, 359, 360, 20_430, 20_442, 20_519, 20_520] {
                let micros = day * DAY + 5 * HOUR;
                let start = level.bucket_start(micros);
                let end = start.saturating_add(level.width());
                let child_start = child.bucket_start(micros);
                assert!(start <= child_start);
                assert!(child_start.saturating_add(child.width()) <= end);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_stability_tracks_changes() {
        let mut tree = MerkleTree::new();
        tree.insert(&id_at(10), Status::Alive);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(tree.root_stable_for() >= Duration::from_secs(30));

        tree.insert(&id_at(20), Status::Alive);
        assert!(tree.root_stable_for() < Duration::from_secs(1));
    }
}
