/*
    join.rs - Asking an entity for membership

    Requester J                                  Owner O (a master)
      | Join/Request{entity,user,pk}   (KeySent)   |
      |------------------------------------------->|  reserve slot(J, salt)
      |                   JoinAck/Challenge{salt}  |
      |<-------------------------------------------|
      | Join/ChallengeAck{sign(salt,..)}           |
      |------------------------------------------->|  slot -> ConfirmJoin
      |       (ChallengeAckSent)  JoinAck/Pending  |
      |<-------------------------------------------|
      |       (AwaitingApproval)                   |  confirm_join(id, approve)
      |          JoinAck/Approve{bundle} | Reject  |
      |<-------------------------------------------|
      |  Approved | Rejected                       |

    Both directions are encrypted with the entity's join-key and routed by its
    hash. The owner keeps one slot per join-key; a slot nobody answered within
    the join timeout is released so the key can be used again.
*/

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::{RouterError, RouterResult};
use crate::core_entity::{ApproveJoin, KeyInfo, RouteHash};
use crate::core_identity::{domain, signing_payload, IdentityProof, MyIdentity, PeerId, UserId};
use crate::core_oplog::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMsg {
    pub entity_id: EntityId,
    pub user_id: UserId,
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinChallengeMsg {
    pub salt: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEntityMsg {
    pub proof: IdentityProof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinApproveMsg {
    pub bundle: ApproveJoin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRejectMsg {
    pub reason: String,
}

/// What the requester signs to answer the owner's challenge
pub fn join_payload(salt: &[u8; 32], entity: &EntityId, requester: &PeerId, owner: &PeerId) -> Vec<u8> {
    signing_payload(
        domain::JOIN,
        &[salt, entity.as_bytes(), requester.as_bytes(), owner.as_bytes()],
    )
}

pub fn answer_join_challenge(
    me: &MyIdentity,
    salt: &[u8; 32],
    entity: &EntityId,
    owner: &PeerId,
) -> JoinEntityMsg {
    JoinEntityMsg {
        proof: me.prove(&join_payload(salt, entity, &me.peer_id(), owner)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Init,
    KeySent,
    ChallengeAckSent,
    AwaitingApproval,
    Approved,
    Rejected,
    Expired,
}

impl JoinState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JoinState::Approved | JoinState::Rejected | JoinState::Expired)
    }
}

/// Requester-side record of one join attempt
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub entity_id: EntityId,
    pub owner: PeerId,
    join_key: KeyInfo,
    state: JoinState,
    deadline: Instant,
    timeout: Duration,
    finished_at: Option<Instant>,
}

impl JoinRequest {
    pub fn new(entity_id: EntityId, join_key: KeyInfo, owner: PeerId, now: Instant, timeout: Duration) -> Self {
        Self {
            entity_id,
            owner,
            join_key,
            state: JoinState::Init,
            deadline: now + timeout,
            timeout,
            finished_at: None,
        }
    }

    pub fn join_key(&self) -> &KeyInfo {
        &self.join_key
    }

    pub fn hash(&self) -> RouteHash {
        self.join_key.route_hash()
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    fn advance(&mut self, from: &[JoinState], to: JoinState) -> RouterResult<()> {
        if !from.contains(&self.state) {
            return Err(RouterError::Join(format!(
                "cannot move from {:?} to {:?}",
                self.state, to
            )));
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    pub fn on_sent(&mut self) -> RouterResult<()> {
        self.advance(&[JoinState::Init], JoinState::KeySent)
    }

    pub fn on_challenge(&mut self) -> RouterResult<()> {
        self.advance(&[JoinState::KeySent], JoinState::ChallengeAckSent)
    }

    /// The owner drops unanswered confirmations after one join timeout and
    /// rejects them, so we give up only after twice that.
    pub fn on_pending(&mut self) -> RouterResult<()> {
        self.advance(&[JoinState::ChallengeAckSent], JoinState::AwaitingApproval)?;
        self.deadline = Instant::now() + self.timeout * 2;
        Ok(())
    }

    pub fn on_approved(&mut self) -> RouterResult<()> {
        self.advance(
            &[JoinState::ChallengeAckSent, JoinState::AwaitingApproval],
            JoinState::Approved,
        )
    }

    pub fn on_rejected(&mut self) -> RouterResult<()> {
        self.advance(
            &[
                JoinState::KeySent,
                JoinState::ChallengeAckSent,
                JoinState::AwaitingApproval,
            ],
            JoinState::Rejected,
        )
    }

    /// Give up on an attempt the owner stopped answering
    pub fn expire(&mut self) {
        if !self.state.is_terminal() {
            self.state = JoinState::Expired;
            self.finished_at = Some(Instant::now());
        }
    }

    /// Returns true when the attempt just expired
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if !self.state.is_terminal() && now >= self.deadline {
            self.state = JoinState::Expired;
            self.finished_at = Some(now);
            return true;
        }
        false
    }

    /// A finished attempt is kept for one join timeout so callers can read
    /// its outcome, then dropped
    pub fn is_stale(&self, now: Instant) -> bool {
        self.finished_at
            .is_some_and(|finished| now >= finished + self.timeout)
    }
}

/// Owner-side reservation of a join-key while its challenge is outstanding
#[derive(Debug, Clone)]
pub struct JoinSlot {
    pub entity_id: EntityId,
    pub peer: PeerId,
    pub user_id: UserId,
    pub public_key: [u8; 32],
    pub salt: [u8; 32],
    pub deadline: Instant,
}

impl JoinSlot {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Check the requester's answer to this slot's challenge
    pub fn verify(&self, msg: &JoinEntityMsg, owner: &PeerId) -> RouterResult<()> {
        if msg.proof.user_id != self.user_id || msg.proof.public_key != self.public_key {
            return Err(RouterError::Join("proof does not match join request".into()));
        }
        msg.proof
            .verify(&join_payload(&self.salt, &self.entity_id, &self.peer, owner))
            .map_err(|e| RouterError::Join(e.to_string()))
    }
}

/// A verified join waiting for approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmJoin {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub peer: PeerId,
    pub user_id: UserId,
    pub public_key: [u8; 32],
    pub join_hash: RouteHash,
    /// Unanswered confirmations are rejected after this
    pub deadline: Instant,
}

impl ConfirmJoin {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_entity::KeyKind;
    use crate::core_identity::random_bytes;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn request() -> JoinRequest {
        JoinRequest::new(
            EntityId::new(),
            KeyInfo::generate(KeyKind::Join, None),
            MyIdentity::generate().peer_id(),
            Instant::now(),
            TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let mut req = request();
        req.on_sent().unwrap();
        req.on_challenge().unwrap();
        req.on_pending().unwrap();
        req.on_approved().unwrap();
        assert_eq!(req.state(), JoinState::Approved);
        assert!(req.on_rejected().is_err());
    }

    #[tokio::test]
    async fn test_approve_without_pending_notice() {
        let mut req = request();
        req.on_sent().unwrap();
        req.on_challenge().unwrap();
        req.on_approved().unwrap();
        assert!(req.state().is_terminal());
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let mut req = request();
        assert!(req.on_challenge().is_err());
        req.on_sent().unwrap();
        assert!(req.on_approved().is_err());
        assert_eq!(req.state(), JoinState::KeySent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaiting_approval_outlives_wire_timeout() {
        let mut waiting = request();
        waiting.on_sent().unwrap();
        let mut approving = request();
        approving.on_sent().unwrap();
        approving.on_challenge().unwrap();
        approving.on_pending().unwrap();

        tokio::time::advance(TIMEOUT).await;
        assert!(waiting.check_timeout(Instant::now()));
        assert_eq!(waiting.state(), JoinState::Expired);
        assert!(!approving.check_timeout(Instant::now()));
        assert_eq!(approving.state(), JoinState::AwaitingApproval);

        tokio::time::advance(TIMEOUT).await;
        assert!(approving.check_timeout(Instant::now()));
        assert_eq!(approving.state(), JoinState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_request_goes_stale_after_timeout() {
        let mut req = request();
        req.on_sent().unwrap();
        assert!(!req.is_stale(Instant::now()));

        req.on_rejected().unwrap();
        assert!(!req.is_stale(Instant::now()));
        tokio::time::advance(TIMEOUT).await;
        assert!(req.is_stale(Instant::now()));
    }

    #[tokio::test]
    async fn test_slot_verifies_proof() {
        let requester = MyIdentity::generate();
        let owner = MyIdentity::generate().peer_id();
        let slot = JoinSlot {
            entity_id: EntityId::new(),
            peer: requester.peer_id(),
            user_id: requester.user_id(),
            public_key: requester.user_public_key(),
            salt: random_bytes::<32>(),
            deadline: Instant::now() + TIMEOUT,
        };

        let good = answer_join_challenge(&requester, &slot.salt, &slot.entity_id, &owner);
        assert!(slot.verify(&good, &owner).is_ok());

        let wrong_salt = answer_join_challenge(&requester, &[1; 32], &slot.entity_id, &owner);
        assert!(slot.verify(&wrong_salt, &owner).is_err());

        let stranger = MyIdentity::generate();
        let other = answer_join_challenge(&stranger, &slot.salt, &slot.entity_id, &owner);
        assert!(slot.verify(&other, &owner).is_err());
    }
}
