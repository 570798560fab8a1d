//! Oplog records and their signatures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{OplogError, OplogResult};
use super::types::{EntityId, LogCategory, LogId, ObjectId, Status, Timestamp};
use crate::core_identity::{domain, signing_payload, Keypair, UserId};

/// State change carried by an oplog. The variant decides the category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    AddMaster { user_id: UserId, public_key: [u8; 32] },
    /// Withdraw the approval given by the master-oplog `target`
    RevokeMaster { user_id: UserId, target: LogId },
    DeleteEntity,
    AddMember { user_id: UserId, public_key: [u8; 32] },
    RemoveMember { user_id: UserId },
    CreateOpKey { key_id: Uuid, expire_ts: Timestamp },
    CreateObject { object_id: ObjectId, data: Vec<u8> },
    UpdateObject { object_id: ObjectId, data: Vec<u8> },
    DeleteObject { object_id: ObjectId },
}

impl OpKind {
    pub fn category(&self) -> LogCategory {
        match self {
            OpKind::AddMaster { .. } | OpKind::RevokeMaster { .. } | OpKind::DeleteEntity => {
                LogCategory::Master
            }
            OpKind::AddMember { .. } | OpKind::RemoveMember { .. } => LogCategory::Member,
            OpKind::CreateOpKey { .. } => LogCategory::OpKey,
            OpKind::CreateObject { .. }
            | OpKind::UpdateObject { .. }
            | OpKind::DeleteObject { .. } => LogCategory::Object,
        }
    }

    /// The item concurrent oplogs race for. Oplogs with the same target are
    /// resolved by the tie-break; `None` means the op stands alone.
    pub fn target(&self) -> Option<Vec<u8>> {
        match self {
            OpKind::AddMember { user_id, .. } | OpKind::RemoveMember { user_id } => {
                Some(user_id.as_bytes().to_vec())
            }
            OpKind::CreateObject { object_id, .. }
            | OpKind::UpdateObject { object_id, .. }
            | OpKind::DeleteObject { object_id } => Some(object_id.as_bytes().to_vec()),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::AddMaster { .. } => "add_master",
            OpKind::RevokeMaster { .. } => "revoke_master",
            OpKind::DeleteEntity => "delete_entity",
            OpKind::AddMember { .. } => "add_member",
            OpKind::RemoveMember { .. } => "remove_member",
            OpKind::CreateOpKey { .. } => "create_op_key",
            OpKind::CreateObject { .. } => "create_object",
            OpKind::UpdateObject { .. } => "update_object",
            OpKind::DeleteObject { .. } => "delete_object",
        }
    }
}

/// One signature over an oplog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    pub signer_id: UserId,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
    /// For master signs: the master-oplog that approved the signer
    pub master_log_id: Option<LogId>,
}

#[derive(Serialize)]
struct SignedContent<'a> {
    id: &'a LogId,
    entity_id: &'a EntityId,
    op: &'a OpKind,
    creator_id: &'a UserId,
    update_ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oplog {
    pub id: LogId,
    pub entity_id: EntityId,
    pub op: OpKind,
    pub creator_id: UserId,
    pub update_ts: Timestamp,
    pub status: Status,
    /// Master-oplog this record was authorized under, set once validated
    pub master_log_id: Option<LogId>,
    pub creator_sign: Option<SignInfo>,
    /// Device signatures of the creator's nodes
    pub internal_signs: Vec<SignInfo>,
    /// Ordered by signer, at most one per signer
    pub master_signs: Vec<SignInfo>,
}

impl Oplog {
    pub fn new(entity_id: EntityId, op: OpKind, creator_id: UserId, update_ts: Timestamp) -> Self {
        Oplog {
            id: LogId::new(update_ts),
            entity_id,
            op,
            creator_id,
            update_ts,
            status: Status::Internal,
            master_log_id: None,
            creator_sign: None,
            internal_signs: Vec::new(),
            master_signs: Vec::new(),
        }
    }

    pub fn category(&self) -> LogCategory {
        self.op.category()
    }

    fn digest(&self) -> OplogResult<[u8; 32]> {
        let content = SignedContent {
            id: &self.id,
            entity_id: &self.entity_id,
            op: &self.op,
            creator_id: &self.creator_id,
            update_ts: self.update_ts,
        };
        let bytes = bincode::serialize(&content)?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }

    fn creator_payload(&self) -> OplogResult<Vec<u8>> {
        Ok(signing_payload(domain::OPLOG, &[&self.digest()?]))
    }

    fn internal_payload(&self) -> OplogResult<Vec<u8>> {
        Ok(signing_payload(domain::INTERNAL_SIGN, &[&self.digest()?]))
    }

    fn master_payload(&self, master_log_id: &LogId) -> OplogResult<Vec<u8>> {
        Ok(signing_payload(
            domain::MASTER_SIGN,
            &[&self.digest()?, master_log_id.as_bytes()],
        ))
    }

    /// Sign as the creator with the user key
    pub fn sign_creator(&mut self, user_key: &Keypair) -> OplogResult<()> {
        let payload = self.creator_payload()?;
        let public_key = user_key.public_key();
        self.creator_sign = Some(SignInfo {
            signer_id: UserId::from_public_key(&public_key),
            public_key,
            signature: user_key.sign(&payload),
            master_log_id: None,
        });
        Ok(())
    }

    /// Sign with a device key on behalf of `user_id`
    pub fn sign_internal(&mut self, node_key: &Keypair, user_id: UserId) -> OplogResult<bool> {
        let payload = self.internal_payload()?;
        let sign = SignInfo {
            signer_id: user_id,
            public_key: node_key.public_key(),
            signature: node_key.sign(&payload),
            master_log_id: None,
        };
        Ok(insert_sign(&mut self.internal_signs, sign))
    }

    /// Add a master signature under the signer's approving master-oplog
    pub fn add_master_sign(&mut self, user_key: &Keypair, master_log_id: LogId) -> OplogResult<bool> {
        let payload = self.master_payload(&master_log_id)?;
        let public_key = user_key.public_key();
        let sign = SignInfo {
            signer_id: UserId::from_public_key(&public_key),
            public_key,
            signature: user_key.sign(&payload),
            master_log_id: Some(master_log_id),
        };
        Ok(insert_sign(&mut self.master_signs, sign))
    }

    /// Union the signatures of another copy of the same oplog. Returns true if anything was added.
    pub fn merge_signs(&mut self, other: &Oplog) -> bool {
        let mut changed = false;
        for sign in &other.internal_signs {
            changed |= insert_sign(&mut self.internal_signs, sign.clone());
        }
        for sign in &other.master_signs {
            changed |= insert_sign(&mut self.master_signs, sign.clone());
        }
        if self.creator_sign.is_none() && other.creator_sign.is_some() {
            self.creator_sign = other.creator_sign.clone();
            changed = true;
        }
        changed
    }

    /// Cryptographic checks only; whether the signers are authorized is up to consensus
    pub fn verify_signatures(&self) -> OplogResult<()> {
        let creator = self.creator_sign.as_ref().ok_or(OplogError::Unsigned(self.id))?;
        if creator.signer_id != self.creator_id || !self.creator_id.is_derived_from(&creator.public_key)
        {
            return Err(self.invalid("creator key does not match creator id"));
        }
        if !Keypair::verify(&creator.public_key, &self.creator_payload()?, &creator.signature) {
            return Err(self.invalid("bad creator signature"));
        }

        if !self.internal_signs.is_empty() {
            let payload = self.internal_payload()?;
            for sign in &self.internal_signs {
                if !Keypair::verify(&sign.public_key, &payload, &sign.signature) {
                    return Err(self.invalid("bad internal signature"));
                }
            }
        }

        for sign in &self.master_signs {
            let master_log_id = sign
                .master_log_id
                .ok_or_else(|| self.invalid("master sign without master log id"))?;
            if !sign.signer_id.is_derived_from(&sign.public_key) {
                return Err(self.invalid("master key does not match signer"));
            }
            if !Keypair::verify(&sign.public_key, &self.master_payload(&master_log_id)?, &sign.signature)
            {
                return Err(self.invalid("bad master signature"));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> OplogError {
        OplogError::InvalidSignature {
            id: self.id,
            reason: reason.to_string(),
        }
    }

    pub fn is_master_signed(&self) -> bool {
        self.master_log_id.is_some()
    }
}

/// Insert keeping the list ordered by signer, one entry per signer and
/// approving master-oplog
fn insert_sign(list: &mut Vec<SignInfo>, sign: SignInfo) -> bool {
    let key = (sign.signer_id, sign.master_log_id);
    match list.binary_search_by(|s| (s.signer_id, s.master_log_id).cmp(&key)) {
        Ok(_) => false,
        Err(pos) => {
            list.insert(pos, sign);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::MyIdentity;

    fn signed(me: &MyIdentity) -> Oplog {
        let mut log = Oplog::new(
            EntityId::new(),
            OpKind::CreateObject {
                object_id: ObjectId::new(),
                data: b"card".to_vec(),
            },
            me.user_id(),
            Timestamp::now(),
        );
        log.sign_creator(me.user_key()).unwrap();
        log
    }

    #[test]
    fn test_creator_signature_verifies() {
        let me = MyIdentity::generate();
        let log = signed(&me);
        assert!(log.verify_signatures().is_ok());
        assert_eq!(log.category(), LogCategory::Object);
        assert_eq!(log.status, Status::Internal);
    }

    #[test]
    fn test_tampered_content_fails() {
        let me = MyIdentity::generate();
        let mut log = signed(&me);
        log.update_ts = Timestamp::from_micros(log.update_ts.as_micros() + 1);
        assert!(matches!(
            log.verify_signatures(),
            Err(OplogError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_unsigned_fails() {
        let me = MyIdentity::generate();
        let log = Oplog::new(EntityId::new(), OpKind::DeleteEntity, me.user_id(), Timestamp::now());
        assert!(matches!(log.verify_signatures(), Err(OplogError::Unsigned(_))));
    }

    #[test]
    fn test_master_signs_dedupe_and_merge() {
        let me = MyIdentity::generate();
        let other = MyIdentity::generate();
        let master_log = LogId::new(Timestamp::from_secs(1));

        let mut a = signed(&me);
        assert!(a.add_master_sign(me.user_key(), master_log).unwrap());
        assert!(!a.add_master_sign(me.user_key(), master_log).unwrap());

        let mut b = a.clone();
        b.master_signs.clear();
        b.add_master_sign(other.user_key(), master_log).unwrap();

        assert!(a.merge_signs(&b));
        assert_eq!(a.master_signs.len(), 2);
        assert!(!a.merge_signs(&b));
        assert!(a.verify_signatures().is_ok());
        assert!(a.master_signs.windows(2).all(|w| w[0].signer_id < w[1].signer_id));
    }

    #[test]
    fn test_fresh_master_sign_not_blocked_by_stale_one() {
        let me = MyIdentity::generate();
        let stale = LogId::new(Timestamp::from_secs(1));
        let fresh = LogId::new(Timestamp::from_secs(2));

        let mut log = signed(&me);
        assert!(log.add_master_sign(me.user_key(), stale).unwrap());
        assert!(log.add_master_sign(me.user_key(), fresh).unwrap());
        assert!(!log.add_master_sign(me.user_key(), fresh).unwrap());

        let approving: Vec<_> = log.master_signs.iter().map(|s| s.master_log_id).collect();
        assert_eq!(approving, vec![Some(stale), Some(fresh)]);
        assert!(log.verify_signatures().is_ok());

        let mut copy = log.clone();
        copy.master_signs.retain(|s| s.master_log_id == Some(stale));
        assert!(copy.merge_signs(&log));
        assert_eq!(copy.master_signs.len(), 2);
    }

    #[test]
    fn test_internal_sign_uses_device_key() {
        let me = MyIdentity::generate();
        let mut log = signed(&me);
        assert!(log.sign_internal(me.node_key(), me.user_id()).unwrap());
        assert_eq!(log.internal_signs[0].public_key, me.node_public_key());
        assert!(log.verify_signatures().is_ok());
    }
}
