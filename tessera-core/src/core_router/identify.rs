/*
    identify.rs - Learning the UserId behind a connected peer

    Verifier V                              Responder R
      |  IdentifyPeer                          |
      |--------------------------------------->|
      |          IdentifyPeerWithMyId{user,pk} |
      |<---------------------------------------|
      |  Challenge{salt}         (ChallengeSent)
      |--------------------------------------->|
      |      ChallengeAck{sign(salt,V,R)}      |
      |<---------------------------------------|  (ChallengeAckReceived)
      |  Ack{user}                 (Identified)
      |--------------------------------------->|

    Any check failing, or the deadline passing, moves the session to Failed. A
    failed session is retried after an exponential backoff until the attempt
    budget is spent; the peer then simply stays Random.
*/

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::errors::{RouterError, RouterResult};
use crate::core_identity::{domain, random_bytes, signing_payload, IdentityProof, MyIdentity, PeerId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPeerMsg {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithMyIdMsg {
    pub user_id: UserId,
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMsg {
    pub salt: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeAckMsg {
    pub proof: IdentityProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyAckMsg {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyFailMsg {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyState {
    /// IdentifyPeer sent, waiting for the claim
    Init,
    ChallengeSent,
    ChallengeAckReceived,
    Identified,
    Failed,
}

/// What the responder signs
pub fn challenge_payload(salt: &[u8; 32], verifier: &PeerId, prover: &PeerId) -> Vec<u8> {
    signing_payload(
        domain::IDENTIFY,
        &[salt, verifier.as_bytes(), prover.as_bytes()],
    )
}

/// Responder side: answer a challenge from `verifier`
pub fn answer_challenge(me: &MyIdentity, salt: &[u8; 32], verifier: &PeerId) -> ChallengeAckMsg {
    let payload = challenge_payload(salt, verifier, &me.peer_id());
    ChallengeAckMsg {
        proof: me.prove(&payload),
    }
}

/// Verifier-side state for one peer
#[derive(Debug, Clone)]
pub struct IdentifySession {
    state: IdentifyState,
    claim: Option<WithMyIdMsg>,
    salt: Option<[u8; 32]>,
    attempts: u32,
    deadline: Instant,
    retry_at: Option<Instant>,
}

impl IdentifySession {
    pub fn start(now: Instant, timeout: Duration) -> Self {
        Self {
            state: IdentifyState::Init,
            claim: None,
            salt: None,
            attempts: 1,
            deadline: now + timeout,
            retry_at: None,
        }
    }

    pub fn state(&self) -> IdentifyState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.state,
            IdentifyState::Init | IdentifyState::ChallengeSent | IdentifyState::ChallengeAckReceived
        )
    }

    /// The responder told us who it claims to be; returns the salt to challenge it with
    pub fn on_claim(&mut self, claim: WithMyIdMsg) -> RouterResult<[u8; 32]> {
        if self.state != IdentifyState::Init {
            return Err(RouterError::Identify(format!("claim in state {:?}", self.state)));
        }
        if !claim.user_id.is_derived_from(&claim.public_key) {
            return Err(RouterError::Identify("claimed key does not match user id".into()));
        }
        let salt = random_bytes::<32>();
        self.claim = Some(claim);
        self.salt = Some(salt);
        self.state = IdentifyState::ChallengeSent;
        Ok(salt)
    }

    /// Check the responder's signature over our salt
    pub fn on_challenge_ack(
        &mut self,
        ack: &ChallengeAckMsg,
        verifier: &PeerId,
        prover: &PeerId,
    ) -> RouterResult<UserId> {
        if self.state != IdentifyState::ChallengeSent {
            return Err(RouterError::Identify(format!("challenge ack in state {:?}", self.state)));
        }
        self.state = IdentifyState::ChallengeAckReceived;

        let (claim, salt) = match (&self.claim, &self.salt) {
            (Some(claim), Some(salt)) => (claim, salt),
            _ => return Err(RouterError::Identify("no outstanding challenge".into())),
        };
        if ack.proof.user_id != claim.user_id || ack.proof.public_key != claim.public_key {
            return Err(RouterError::Identify("proof does not match claim".into()));
        }
        ack.proof
            .verify(&challenge_payload(salt, verifier, prover))
            .map_err(|e| RouterError::Identify(e.to_string()))?;

        self.state = IdentifyState::Identified;
        Ok(claim.user_id)
    }

    pub fn fail(&mut self, now: Instant, backoff: Duration, max_attempts: u32) {
        self.state = IdentifyState::Failed;
        self.claim = None;
        self.salt = None;
        self.retry_at = if self.attempts < max_attempts {
            let factor = 1u32 << (self.attempts - 1).min(16);
            Some(now + backoff.saturating_mul(factor))
        } else {
            None
        };
    }

    /// Fail the session if its deadline passed; returns true when it did
    pub fn check_timeout(&mut self, now: Instant, backoff: Duration, max_attempts: u32) -> bool {
        if self.is_in_flight() && now >= self.deadline {
            self.fail(now, backoff, max_attempts);
            return true;
        }
        false
    }

    pub fn retry_due(&self, now: Instant) -> bool {
        self.state == IdentifyState::Failed && matches!(self.retry_at, Some(at) if now >= at)
    }

    pub fn retry(&mut self, now: Instant, timeout: Duration) {
        self.attempts += 1;
        self.state = IdentifyState::Init;
        self.deadline = now + timeout;
        self.retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);
    const BACKOFF: Duration = Duration::from_secs(2);

    fn claim_of(who: &MyIdentity) -> WithMyIdMsg {
        WithMyIdMsg {
            user_id: who.user_id(),
            public_key: who.user_public_key(),
        }
    }

    #[tokio::test]
    async fn test_successful_identify() {
        let verifier = MyIdentity::generate();
        let responder = MyIdentity::generate();
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);

        let salt = session.on_claim(claim_of(&responder)).unwrap();
        assert_eq!(session.state(), IdentifyState::ChallengeSent);

        let ack = answer_challenge(&responder, &salt, &verifier.peer_id());
        let user = session
            .on_challenge_ack(&ack, &verifier.peer_id(), &responder.peer_id())
            .unwrap();
        assert_eq!(user, responder.user_id());
        assert_eq!(session.state(), IdentifyState::Identified);
    }

    #[tokio::test]
    async fn test_proof_for_other_user_rejected() {
        let verifier = MyIdentity::generate();
        let responder = MyIdentity::generate();
        let impostor = MyIdentity::generate();
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);

        let salt = session.on_claim(claim_of(&responder)).unwrap();
        let ack = answer_challenge(&impostor, &salt, &verifier.peer_id());
        assert!(session
            .on_challenge_ack(&ack, &verifier.peer_id(), &responder.peer_id())
            .is_err());
        assert_eq!(session.state(), IdentifyState::ChallengeAckReceived);
    }

    #[tokio::test]
    async fn test_wrong_salt_rejected() {
        let verifier = MyIdentity::generate();
        let responder = MyIdentity::generate();
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);

        session.on_claim(claim_of(&responder)).unwrap();
        let ack = answer_challenge(&responder, &[0u8; 32], &verifier.peer_id());
        assert!(session
            .on_challenge_ack(&ack, &verifier.peer_id(), &responder.peer_id())
            .is_err());
    }

    #[tokio::test]
    async fn test_replayed_to_other_verifier_rejected() {
        let verifier = MyIdentity::generate();
        let other = MyIdentity::generate();
        let responder = MyIdentity::generate();
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);

        let salt = session.on_claim(claim_of(&responder)).unwrap();
        let ack = answer_challenge(&responder, &salt, &other.peer_id());
        assert!(session
            .on_challenge_ack(&ack, &verifier.peer_id(), &responder.peer_id())
            .is_err());
    }

    #[tokio::test]
    async fn test_mismatched_claim_rejected() {
        let responder = MyIdentity::generate();
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);
        let claim = WithMyIdMsg {
            user_id: MyIdentity::generate().user_id(),
            public_key: responder.user_public_key(),
        };
        assert!(session.on_claim(claim).is_err());
        assert_eq!(session.state(), IdentifyState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_backoff() {
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);
        assert!(!session.check_timeout(Instant::now(), BACKOFF, 3));

        tokio::time::advance(TIMEOUT).await;
        assert!(session.check_timeout(Instant::now(), BACKOFF, 3));
        assert_eq!(session.state(), IdentifyState::Failed);
        assert!(!session.retry_due(Instant::now()));

        tokio::time::advance(BACKOFF).await;
        assert!(session.retry_due(Instant::now()));
        session.retry(Instant::now(), TIMEOUT);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.state(), IdentifyState::Init);

        // second failure doubles the wait
        session.fail(Instant::now(), BACKOFF, 3);
        tokio::time::advance(BACKOFF).await;
        assert!(!session.retry_due(Instant::now()));
        tokio::time::advance(BACKOFF).await;
        assert!(session.retry_due(Instant::now()));
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let mut session = IdentifySession::start(Instant::now(), TIMEOUT);
        session.fail(Instant::now(), Duration::ZERO, 1);
        assert!(!session.retry_due(Instant::now() + Duration::from_secs(3600)));
    }
}
