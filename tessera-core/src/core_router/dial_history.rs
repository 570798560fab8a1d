//! Nodes we dialed on behalf of an entity
//!
//! When we connect out to a node because an entity needs it, the op-key hash
//! and wanted tier are remembered here so the node can be bound to that entity
//! once it shows up and identifies.

use hashlink::LruCache;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::core_entity::{PeerType, RouteHash};
use crate::core_identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialEntry {
    pub hash: RouteHash,
    pub peer_type: PeerType,
    pub at: Instant,
}

pub struct DialHistory {
    ttl: Duration,
    entries: Mutex<LruCache<PeerId, DialEntry>>,
}

impl DialHistory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    pub fn add(&self, peer: PeerId, hash: RouteHash, peer_type: PeerType) {
        let entry = DialEntry {
            hash,
            peer_type,
            at: Instant::now(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, entry);
    }

    /// Live entry for `peer`, if any
    pub fn get(&self, peer: &PeerId) -> Option<DialEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = *entries.get(peer)?;
        if entry.at.elapsed() >= self.ttl {
            entries.remove(peer);
            return None;
        }
        Some(entry)
    }

    pub fn remove(&self, peer: &PeerId) -> Option<DialEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }

    /// Drop expired entries, returning how many went
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<PeerId> = entries
            .iter()
            .filter(|(_, e)| e.at.elapsed() >= self.ttl)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            entries.remove(peer);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::MyIdentity;

    fn peer() -> PeerId {
        MyIdentity::generate().peer_id()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let history = DialHistory::new(8, Duration::from_secs(10));
        let p = peer();
        history.add(p, RouteHash::EMPTY, PeerType::Member);
        assert_eq!(history.get(&p).unwrap().peer_type, PeerType::Member);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(history.get(&p).is_none());
        assert!(history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let history = DialHistory::new(8, Duration::from_secs(10));
        history.add(peer(), RouteHash::EMPTY, PeerType::Member);
        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = peer();
        history.add(fresh, RouteHash::EMPTY, PeerType::Important);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(history.purge_expired(), 1);
        assert!(history.get(&fresh).is_some());
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let history = DialHistory::new(2, Duration::from_secs(60));
        let first = peer();
        history.add(first, RouteHash::EMPTY, PeerType::Member);
        history.add(peer(), RouteHash::EMPTY, PeerType::Member);
        history.add(peer(), RouteHash::EMPTY, PeerType::Member);
        assert_eq!(history.len(), 2);
        assert!(history.get(&first).is_none());
    }
}
