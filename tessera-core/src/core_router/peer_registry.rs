/*
    peer_registry.rs - Tiered peer maps with per-tier and global capacity

    Tiers, highest priority first:

        Me > Hub > Important > Member > Pending > Random

    Admission order:
      1. Me is always admitted and never counts against any capacity
      2. another peer already holding the same UserId -> AlreadyRegistered
      3. target tier full -> TooManyPeers
      4. global cap reached by a new peer -> evict one random peer from the
         lowest non-empty tier at or below the target, then admit

    Every public method takes the registry lock itself; none may be called while
    the caller holds a guard obtained from this registry.
*/

use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use super::errors::AdmissionError;
use super::peer::Peer;
use crate::config::PeerConfig;
use crate::core_entity::PeerType;
use crate::core_identity::{PeerId, UserId};
use crate::metrics;

/// Snapshot row returned by `peers()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub user_id: Option<UserId>,
    pub peer_type: PeerType,
}

const TIERS: usize = 6;

/// Tiers an eviction may take a victim from, lowest first
const EVICTION_ORDER: [PeerType; 5] = [
    PeerType::Random,
    PeerType::Pending,
    PeerType::Member,
    PeerType::Important,
    PeerType::Hub,
];

#[derive(Default)]
struct Inner {
    tiers: [HashMap<PeerId, Arc<Peer>>; TIERS],
    index: HashMap<PeerId, PeerType>,
    /// Owner of each UserId among non-Me peers
    users: HashMap<UserId, PeerId>,
}

impl Inner {
    fn tier(&self, t: PeerType) -> &HashMap<PeerId, Arc<Peer>> {
        &self.tiers[t.rank() as usize]
    }

    fn tier_mut(&mut self, t: PeerType) -> &mut HashMap<PeerId, Arc<Peer>> {
        &mut self.tiers[t.rank() as usize]
    }

    /// Peers counted against the global cap
    fn counted(&self) -> usize {
        EVICTION_ORDER.iter().map(|t| self.tier(*t).len()).sum()
    }

    fn detach(&mut self, id: &PeerId) -> Option<Arc<Peer>> {
        let tier = self.index.remove(id)?;
        let peer = self.tier_mut(tier).remove(id)?;
        self.users.retain(|_, owner| owner != id);
        Some(peer)
    }
}

pub struct PeerRegistry {
    config: PeerConfig,
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn capacity(&self, tier: PeerType) -> usize {
        match tier {
            PeerType::Me => usize::MAX,
            PeerType::Hub => self.config.max_hub_peers,
            PeerType::Important => self.config.max_important_peers,
            PeerType::Member => self.config.max_member_peers,
            PeerType::Pending => self.config.max_pending_peers,
            PeerType::Random => self.config.max_random_peers,
        }
    }

    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    /// Place `peer` in `tier`, moving it if it is already registered.
    ///
    /// Returns the peer evicted to make room, which has already been removed and
    /// closed. On error nothing changed.
    pub fn admit(&self, peer: &Arc<Peer>, tier: PeerType) -> Result<Option<Arc<Peer>>, AdmissionError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.place(&mut inner, peer, tier)
    }

    /// Admission body; the caller holds the write lock
    fn place(
        &self,
        inner: &mut Inner,
        peer: &Arc<Peer>,
        tier: PeerType,
    ) -> Result<Option<Arc<Peer>>, AdmissionError> {
        let id = peer.id();
        let current = inner.index.get(&id).copied();
        let user = peer.user_id().filter(|_| tier != PeerType::Me);
        if let Some(user) = user {
            if let Some(owner) = inner.users.get(&user) {
                if *owner != id {
                    return Err(AdmissionError::AlreadyRegistered(user));
                }
            }
        }
        if current == Some(tier) {
            // identity may have been learned since the peer was placed
            if let Some(user) = user {
                inner.users.insert(user, id);
            }
            return Ok(None);
        }

        let mut evicted = None;
        if tier != PeerType::Me {
            if inner.tier(tier).len() >= self.capacity(tier) {
                return Err(AdmissionError::TooManyPeers(tier));
            }

            let already_counted = matches!(current, Some(t) if t != PeerType::Me);
            if !already_counted && inner.counted() >= self.config.max_peers {
                let victim_tier = EVICTION_ORDER
                    .iter()
                    .copied()
                    .take_while(|t| *t <= tier)
                    .find(|t| !inner.tier(*t).is_empty())
                    .ok_or(AdmissionError::TooManyPeers(tier))?;
                let victim_id = inner
                    .tier(victim_tier)
                    .keys()
                    .copied()
                    .choose(&mut rand::rng())
                    .ok_or(AdmissionError::TooManyPeers(tier))?;
                if let Some(victim) = inner.detach(&victim_id) {
                    victim.set_peer_type(None);
                    victim.close();
                    metrics::peer_evicted(victim_tier.as_str());
                    info!(peer = %victim_id, tier = %victim_tier, "Evicted peer to admit {}", id);
                    evicted = Some(victim);
                }
            }
        }

        if let Some(old) = current {
            inner.tier_mut(old).remove(&id);
        }
        inner.tier_mut(tier).insert(id, peer.clone());
        inner.index.insert(id, tier);
        inner.users.retain(|_, owner| *owner != id);
        if let Some(user) = user {
            inner.users.insert(user, id);
        }
        peer.set_peer_type(Some(tier));

        metrics::peer_admitted(tier.as_str());
        metrics::set_active_peers(inner.index.len());
        debug!(peer = %id, from = ?current, to = %tier, "Peer admitted");
        Ok(evicted)
    }

    /// Move a registered peer to `tier`.
    ///
    /// Without `force` only upgrades happen; returns whether the tier changed.
    /// The current tier is read under the same lock that moves the peer.
    pub fn set_peer_type(&self, peer: &Arc<Peer>, tier: PeerType, force: bool) -> Result<bool, AdmissionError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let current = inner.index.get(&peer.id()).copied();
        if !force && matches!(current, Some(t) if t >= tier) {
            return Ok(false);
        }
        self.place(&mut inner, peer, tier)?;
        Ok(current != Some(tier))
    }

    pub fn tier_of(&self, id: &PeerId) -> Option<PeerType> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .get(id)
            .copied()
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let peer = inner.detach(id)?;
        peer.set_peer_type(None);
        metrics::set_active_peers(inner.index.len());
        Some(peer)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let tier = inner.index.get(id)?;
        inner.tier(*tier).get(id).cloned()
    }

    pub fn peer_by_user(&self, user: &UserId) -> Option<Arc<Peer>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.users.get(user) {
            let tier = inner.index.get(id)?;
            return inner.tier(*tier).get(id).cloned();
        }
        // own devices are not indexed by user
        inner
            .tier(PeerType::Me)
            .values()
            .find(|p| p.user_id().as_ref() == Some(user))
            .cloned()
    }

    pub fn count_peers(&self) -> BTreeMap<PeerType, usize> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        PeerType::BY_PRIORITY
            .iter()
            .map(|t| (*t, inner.tier(*t).len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.by_priority()
            .into_iter()
            .filter_map(|p| {
                Some(PeerInfo {
                    peer_id: p.id(),
                    user_id: p.user_id(),
                    peer_type: p.peer_type()?,
                })
            })
            .collect()
    }

    /// All peers, Me first and Random last
    pub fn by_priority(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        PeerType::BY_PRIORITY
            .iter()
            .flat_map(|t| inner.tier(*t).values().cloned())
            .collect()
    }

    /// Drop every peer, returning them so the caller can close them
    pub fn clear(&self) -> Vec<Arc<Peer>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::take(&mut *inner);
        metrics::set_active_peers(0);
        old.tiers
            .into_iter()
            .flat_map(|tier| tier.into_values())
            .inspect(|p| p.set_peer_type(None))
            .collect()
    }
}
