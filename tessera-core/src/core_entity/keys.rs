//! Op-keys and join-keys
//!
//! Entity traffic is encrypted with a short-lived op-key; join requests with the
//! entity's join-key. Messages are routed by `RouteHash`, a digest of the key
//! material, so only holders of the key can map a message to its entity.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core_identity::random_bytes;
use crate::core_oplog::Timestamp;

const ROUTE_HASH_DOMAIN: &[u8] = b"TESSERA_ROUTE_HASH_V1";
const HKDF_SALT: &[u8] = b"tessera-envelope-key-v1";

pub const ROUTE_HASH_LEN: usize = 20;

/// Routing digest of a key
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteHash([u8; ROUTE_HASH_LEN]);

impl RouteHash {
    pub const EMPTY: RouteHash = RouteHash([0u8; ROUTE_HASH_LEN]);

    pub const fn from_bytes(bytes: [u8; ROUTE_HASH_LEN]) -> Self {
        RouteHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ROUTE_HASH_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for RouteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RouteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteHash({})", hex::encode(&self.0[..6]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Op,
    Join,
}

impl KeyKind {
    fn info(&self) -> &'static [u8] {
        match self {
            KeyKind::Op => b"op-key",
            KeyKind::Join => b"join-key",
        }
    }
}

/// Symmetric key material with its lifetime
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyInfo {
    #[zeroize(skip)]
    pub key_id: Uuid,
    #[zeroize(skip)]
    pub kind: KeyKind,
    material: [u8; 32],
    #[zeroize(skip)]
    pub create_ts: Timestamp,
    /// Zero means the key never expires
    #[zeroize(skip)]
    pub expire_ts: Timestamp,
}

impl KeyInfo {
    pub fn generate(kind: KeyKind, ttl: Option<Duration>) -> Self {
        let now = Timestamp::now();
        KeyInfo {
            key_id: Uuid::new_v4(),
            kind,
            material: random_bytes::<32>(),
            create_ts: now,
            expire_ts: ttl.map(|ttl| now.saturating_add(ttl)).unwrap_or(Timestamp::ZERO),
        }
    }

    pub fn route_hash(&self) -> RouteHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ROUTE_HASH_DOMAIN);
        hasher.update(self.kind.info());
        hasher.update(&self.material);
        let digest = hasher.finalize();
        let mut out = [0u8; ROUTE_HASH_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ROUTE_HASH_LEN]);
        RouteHash(out)
    }

    /// AES-256 key derived from the material with HKDF-SHA256
    pub fn cipher_key(&self) -> Result<Zeroizing<[u8; 32]>, hkdf::InvalidLength> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &self.material);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(self.kind.info(), okm.as_mut())?;
        Ok(okm)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.expire_ts.is_zero() && self.expire_ts <= now
    }
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("key_id", &self.key_id)
            .field("kind", &self.kind)
            .field("expire_ts", &self.expire_ts)
            .finish_non_exhaustive()
    }
}
