//! Handle to one connected peer
//!
//! The handle is shared between the router (which classifies it and queues
//! outbound messages) and the peer's supervised task (which owns the transport
//! and drains the queue). Closing the handle cancels that task.

use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::{RouterError, RouterResult};
use crate::core_entity::PeerType;
use crate::core_identity::{PeerId, UserId};

/// A message waiting to be written to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub code: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct PeerState {
    user_id: Option<UserId>,
    /// `None` until the registry admits the peer
    peer_type: Option<PeerType>,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    version: u32,
    state: RwLock<PeerState>,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl Peer {
    /// New handle plus the receiving end of its outbound queue
    pub fn new(id: PeerId, version: u32, queue: usize) -> (Peer, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let peer = Peer {
            id,
            version,
            state: RwLock::new(PeerState::default()),
            outbound: tx,
            closed: CancellationToken::new(),
        };
        (peer, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).user_id
    }

    pub(crate) fn set_user_id(&self, user: Option<UserId>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).user_id = user;
    }

    pub fn peer_type(&self) -> Option<PeerType> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).peer_type
    }

    /// Only the peer registry moves a peer between tiers
    pub(super) fn set_peer_type(&self, peer_type: Option<PeerType>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).peer_type = peer_type;
    }

    /// Queue a message without waiting
    pub fn send(&self, code: u64, bytes: Vec<u8>) -> RouterResult<()> {
        if self.is_closed() {
            return Err(RouterError::PeerClosed(self.id));
        }
        self.outbound
            .try_send(Outbound { code, bytes })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RouterError::QueueFull(self.id),
                mpsc::error::TrySendError::Closed(_) => RouterError::PeerClosed(self.id),
            })
    }

    /// Ask the peer's task to shut the connection down
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::MyIdentity;

    fn new_peer(queue: usize) -> (Peer, mpsc::Receiver<Outbound>) {
        Peer::new(MyIdentity::generate().peer_id(), 1, queue)
    }

    #[test]
    fn test_send_queues_message() {
        let (peer, mut rx) = new_peer(4);
        peer.send(3, vec![1]).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound {
                code: 3,
                bytes: vec![1]
            }
        );
    }

    #[test]
    fn test_full_queue_does_not_block() {
        let (peer, _rx) = new_peer(1);
        peer.send(3, vec![]).unwrap();
        assert!(matches!(peer.send(3, vec![]), Err(RouterError::QueueFull(_))));
    }

    #[test]
    fn test_closed_peer_rejects_send() {
        let (peer, _rx) = new_peer(4);
        peer.close();
        assert!(peer.is_closed());
        assert!(matches!(peer.send(3, vec![]), Err(RouterError::PeerClosed(_))));
    }

    #[test]
    fn test_user_and_type_start_empty() {
        let (peer, _rx) = new_peer(4);
        assert!(peer.user_id().is_none());
        assert!(peer.peer_type().is_none());
        let user = MyIdentity::generate().user_id();
        peer.set_user_id(Some(user));
        assert_eq!(peer.user_id(), Some(user));
    }
}
