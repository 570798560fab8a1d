//! Stable identifiers
//!
//! `UserId` names a human account and is the blake3 hash of the user's public key, so
//! any signature carrying the public key is self-certifying. `PeerId` names one node
//! (device) and is the node's public key itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::IdentityError;

macro_rules! bs58_id {
    ($name:ident) => {
        impl $name {
            pub const LEN: usize = 32;

            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_base58(&self) -> String {
                bs58::encode(&self.0).into_string()
            }

            pub fn from_base58(s: &str) -> Result<Self, IdentityError> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| IdentityError::InvalidId(e.to_string()))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| IdentityError::InvalidId(format!("expected {} bytes", Self::LEN)))?;
                Ok($name(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base58())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = self.to_base58();
                write!(f, "{}({})", stringify!($name), &s[..s.len().min(8)])
            }
        }
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId([u8; 32]);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

bs58_id!(UserId);
bs58_id!(PeerId);

impl UserId {
    pub fn from_public_key(pubkey: &[u8]) -> Self {
        UserId(*blake3::hash(pubkey).as_bytes())
    }

    /// True when `pubkey` hashes to this id
    pub fn is_derived_from(&self, pubkey: &[u8]) -> bool {
        UserId::from_public_key(pubkey) == *self
    }
}

impl PeerId {
    pub fn from_public_key(pubkey: [u8; 32]) -> Self {
        PeerId(pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_derivation_is_deterministic() {
        let id1 = UserId::from_public_key(&[1, 2, 3]);
        let id2 = UserId::from_public_key(&[1, 2, 3]);
        assert_eq!(id1, id2);
        assert!(id1.is_derived_from(&[1, 2, 3]));
        assert!(!id1.is_derived_from(&[3, 2, 1]));
    }

    #[test]
    fn test_base58_roundtrip() {
        let id = UserId::from_public_key(b"key");
        assert_eq!(UserId::from_base58(&id.to_base58()).unwrap(), id);

        let peer = PeerId::from_bytes([7; 32]);
        assert_eq!(PeerId::from_base58(&peer.to_string()).unwrap(), peer);
    }

    #[test]
    fn test_base58_rejects_wrong_length() {
        let short = bs58::encode([1u8; 5]).into_string();
        assert!(matches!(
            UserId::from_base58(&short),
            Err(IdentityError::InvalidId(_))
        ));
        assert!(PeerId::from_base58("0OIl").is_err());
    }
}
