//! Ed25519 keypairs for users and nodes
//!
//! The secret half is held by `ed25519_dalek::SigningKey`, which wipes itself on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use zeroize::Zeroizing;

use super::random_bytes;

/// Length of a serialized public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a detached signature
pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS-seeded thread RNG
    pub fn generate() -> Self {
        let seed = Zeroizing::new(random_bytes::<32>());
        Self::from_seed(&seed)
    }

    /// Rebuild a keypair from its 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Keypair {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Seed bytes for persistence. Wiped when the returned value drops.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }

    /// Verify a detached signature. Malformed keys or signatures verify as false.
    pub fn verify(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        let Ok(pubkey) = <[u8; PUBLIC_KEY_LEN]>::try_from(pubkey) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };

        verifying_key.verify(msg, &signature).is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public_key()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");

        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(Keypair::verify(&kp.public_key(), b"hello", &sig));
        assert!(!Keypair::verify(&kp.public_key(), b"hellO", &sig));
    }

    #[test]
    fn test_verify_rejects_malformed_input() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"msg");

        assert!(!Keypair::verify(&[1, 2, 3], b"msg", &sig));
        assert!(!Keypair::verify(&kp.public_key(), b"msg", &sig[..10]));
    }

    #[test]
    fn test_seed_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let kp = Keypair::generate();
        let debug = format!("{:?}", kp);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(*kp.seed())));
    }
}
