/*
    envelope.rs - Wire envelope codec

    Wire layout (bincode):

        Envelope {
            node:         Option<PeerId>   destination hint, None = broadcast
            code:         u64              CodeType
            hash:         RouteHash        op-key / join-key routing digest
            ev_with_salt: bincode(Event) || salt[16]
            checksum:     blake3(node || code || hash || ev_with_salt)
        }

        Event { code, hash, data }

    `data` is either a plain bincode payload (identify and key-exchange codes) or
    the output of `encrypt`:

        nonce[12] || AES-256-GCM( pkcs7( op:u32be || payload ) )

    On receive the event's code must equal the envelope's code, and for codes below
    RequireHash the event's hash must equal the envelope's hash too.
*/

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use serde::{Deserialize, Serialize};

use super::codes::CodeType;
use super::errors::CodecError;
use super::padding;
use crate::core_entity::{KeyInfo, RouteHash};
use crate::core_identity::{random_bytes, PeerId};

pub const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    node: Option<PeerId>,
    code: u64,
    hash: RouteHash,
    ev_with_salt: Vec<u8>,
    checksum: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
struct Event {
    code: u64,
    hash: RouteHash,
    data: Vec<u8>,
}

/// A received envelope that passed every integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub code: CodeType,
    pub hash: RouteHash,
    pub data: Vec<u8>,
}

fn checksum(node: Option<&PeerId>, code: u64, hash: &RouteHash, ev_with_salt: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    match node {
        Some(node) => {
            hasher.update(&[1]);
            hasher.update(node.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&code.to_be_bytes());
    hasher.update(hash.as_bytes());
    hasher.update(ev_with_salt);
    *hasher.finalize().as_bytes()
}

fn seal(node: Option<PeerId>, code: u64, hash: RouteHash, event: &Event) -> Result<Vec<u8>, CodecError> {
    let mut ev_with_salt =
        bincode::serialize(event).map_err(|e| CodecError::Malformed(e.to_string()))?;
    ev_with_salt.extend_from_slice(&random_bytes::<SALT_LEN>());
    let checksum = checksum(node.as_ref(), code, &hash, &ev_with_salt);
    let envelope = Envelope {
        node,
        code,
        hash,
        ev_with_salt,
        checksum,
    };
    bincode::serialize(&envelope).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Wrap `data` into wire bytes
pub fn marshal(
    code: CodeType,
    hash: RouteHash,
    data: Vec<u8>,
    node: Option<PeerId>,
) -> Result<Vec<u8>, CodecError> {
    let event = Event {
        code: code.as_u64(),
        hash,
        data,
    };
    seal(node, code.as_u64(), hash, &event)
}

/// Validate wire bytes addressed to `me` and extract the event
pub fn unmarshal(bytes: &[u8], me: &PeerId, max_size: usize) -> Result<Decoded, CodecError> {
    if bytes.len() > max_size {
        return Err(CodecError::Oversize {
            size: bytes.len(),
            max: max_size,
        });
    }

    let envelope: Envelope =
        bincode::deserialize(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let expected = checksum(
        envelope.node.as_ref(),
        envelope.code,
        &envelope.hash,
        &envelope.ev_with_salt,
    );
    if expected != envelope.checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    if let Some(node) = &envelope.node {
        if node != me {
            return Err(CodecError::NotForMe);
        }
    }

    let code = CodeType::from_u64(envelope.code).ok_or(CodecError::InvalidMsgCode(envelope.code))?;
    if code == CodeType::RequireHash {
        return Err(CodecError::InvalidMsgCode(envelope.code));
    }

    if envelope.ev_with_salt.len() < SALT_LEN {
        return Err(CodecError::Malformed("missing salt".into()));
    }
    let ev_bytes = &envelope.ev_with_salt[..envelope.ev_with_salt.len() - SALT_LEN];
    let event: Event =
        bincode::deserialize(ev_bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    if event.code != envelope.code || (code.requires_hash() && event.hash != envelope.hash) {
        return Err(CodecError::HashMismatch);
    }

    Ok(Decoded {
        code,
        hash: envelope.hash,
        data: event.data,
    })
}

fn cipher(key: &KeyInfo) -> Result<Aes256Gcm, CodecError> {
    let key_bytes = key
        .cipher_key()
        .map_err(|e| CodecError::Encrypt(e.to_string()))?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_ref())))
}

/// Encrypt `op || payload` under `key`
pub fn encrypt(op: u32, payload: &[u8], key: &KeyInfo) -> Result<Vec<u8>, CodecError> {
    let mut plain = Vec::with_capacity(4 + payload.len());
    plain.extend_from_slice(&op.to_be_bytes());
    plain.extend_from_slice(payload);
    let padded = padding::pad(&plain);

    let nonce_bytes = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce_bytes), padded.as_slice())
        .map_err(|e| CodecError::Encrypt(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of `encrypt`
pub fn decrypt(data: &[u8], key: &KeyInfo) -> Result<(u32, Vec<u8>), CodecError> {
    if data.len() < NONCE_LEN {
        return Err(CodecError::Decrypt);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let padded = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CodecError::Decrypt)?;
    let plain = padding::unpad(&padded)?;
    if plain.len() < 4 {
        return Err(CodecError::Padding);
    }
    let mut op = [0u8; 4];
    op.copy_from_slice(&plain[..4]);
    Ok((u32::from_be_bytes(op), plain[4..].to_vec()))
}
