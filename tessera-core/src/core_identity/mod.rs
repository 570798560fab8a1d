//! Identity management
//!
//! A running node holds two keys: the user key (shared by all devices of one account,
//! names the `UserId`) and the node key (one per device, names the `PeerId`).

mod ids;
mod keypair;

pub use ids::{PeerId, UserId};
pub use keypair::{Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Signature verification failed: {0}")]
    BadSignature(String),
}

/// Fill a fixed-size buffer from the thread RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill(&mut buf[..]);
    buf
}

/// Domain separators for everything this crate signs
pub mod domain {
    pub const OPLOG: &[u8] = b"TESSERA_OPLOG_V1";
    pub const MASTER_SIGN: &[u8] = b"TESSERA_MASTER_SIGN_V1";
    pub const INTERNAL_SIGN: &[u8] = b"TESSERA_INTERNAL_SIGN_V1";
    pub const IDENTIFY: &[u8] = b"TESSERA_IDENTIFY_V1";
    pub const JOIN: &[u8] = b"TESSERA_JOIN_V1";
}

/// Build a domain-prefixed signing payload
pub fn signing_payload(domain: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = domain.len() + parts.iter().map(|p| p.len() + 4).sum::<usize>();
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(domain);
    for part in parts {
        // length-prefix every part so concatenations cannot collide
        payload.extend_from_slice(&(part.len() as u32).to_be_bytes());
        payload.extend_from_slice(part);
    }
    payload
}

/// A signature together with the public key that produced it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub user_id: UserId,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl IdentityProof {
    pub fn sign(keypair: &Keypair, payload: &[u8]) -> Self {
        let public_key = keypair.public_key();
        IdentityProof {
            user_id: UserId::from_public_key(&public_key),
            public_key,
            signature: keypair.sign(payload),
        }
    }

    /// Check that the key names the claimed user and signed `payload`
    pub fn verify(&self, payload: &[u8]) -> Result<(), IdentityError> {
        if !self.user_id.is_derived_from(&self.public_key) {
            return Err(IdentityError::BadSignature(
                "public key does not match user id".to_string(),
            ));
        }
        if !Keypair::verify(&self.public_key, payload, &self.signature) {
            return Err(IdentityError::BadSignature(format!(
                "invalid signature from {}",
                self.user_id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for IdentityProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProof")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// The local user and device
#[derive(Debug, Clone)]
pub struct MyIdentity {
    user_key: Keypair,
    node_key: Keypair,
    user_id: UserId,
    peer_id: PeerId,
}

impl MyIdentity {
    pub fn new(user_key: Keypair, node_key: Keypair) -> Self {
        let user_id = UserId::from_public_key(&user_key.public_key());
        let peer_id = PeerId::from_public_key(node_key.public_key());
        MyIdentity {
            user_key,
            node_key,
            user_id,
            peer_id,
        }
    }

    /// Fresh user and node keys
    pub fn generate() -> Self {
        Self::new(Keypair::generate(), Keypair::generate())
    }

    /// Another device of the same user
    pub fn new_device(&self) -> Self {
        Self::new(self.user_key.clone(), Keypair::generate())
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn user_public_key(&self) -> [u8; 32] {
        self.user_key.public_key()
    }

    pub fn node_public_key(&self) -> [u8; 32] {
        self.node_key.public_key()
    }

    pub fn user_key(&self) -> &Keypair {
        &self.user_key
    }

    pub fn node_key(&self) -> &Keypair {
        &self.node_key
    }

    /// Prove control of the user key over `payload`
    pub fn prove(&self, payload: &[u8]) -> IdentityProof {
        IdentityProof::sign(&self.user_key, payload)
    }
}
