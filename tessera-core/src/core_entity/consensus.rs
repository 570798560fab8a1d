//! Master consensus
//!
//! The approved master set is derived by scanning the master-oplogs in LogId order.
//! An `AddMaster` is approved when it is not revoked and either bootstraps the
//! entity creator or carries `threshold` signatures from masters approved by
//! strictly earlier master-oplogs. Everything else is validated against that set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::keys::KeyInfo;
use super::EntityRecord;
use crate::core_identity::UserId;
use crate::core_oplog::{LogId, OpKind, Oplog, SignInfo, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Master {
    user_id: UserId,
    public_key: [u8; 32],
}

#[derive(Debug, Clone, Default)]
pub struct MasterSet {
    threshold: usize,
    /// Approving master-oplog → master it approves
    approved: BTreeMap<LogId, Master>,
    /// Every known master-oplog with its stored status
    known: HashMap<LogId, Status>,
    /// Status each master-oplog should carry after this pass
    derived: BTreeMap<LogId, Status>,
    /// Users with an `AddMaster` that is not approved yet
    pending: HashSet<UserId>,
    entity_deleted: bool,
}

/// What validation concluded for one oplog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: Status,
    pub master_log_id: Option<LogId>,
}

impl MasterSet {
    /// Derive the master set from all master-oplogs of an entity
    pub fn compute(creator: UserId, master_logs: &[Oplog], threshold: usize) -> Self {
        let mut logs: Vec<&Oplog> = master_logs.iter().collect();
        logs.sort_by_key(|o| o.id);

        let mut set = MasterSet {
            threshold: threshold.max(1),
            known: logs.iter().map(|o| (o.id, o.status)).collect(),
            ..Default::default()
        };
        let mut revoked: HashSet<LogId> = HashSet::new();

        for log in logs {
            if log.status == Status::Failed {
                continue;
            }
            let dead = log.status == Status::Deleted || revoked.contains(&log.id);
            let (_, count) = set.count_signers(&log.master_signs, Some(log.id));
            let signed = count >= set.threshold;

            let status = match &log.op {
                OpKind::AddMaster { user_id, public_key } => {
                    let bootstrap = *user_id == creator
                        && log.creator_id == creator
                        && log
                            .creator_sign
                            .as_ref()
                            .is_some_and(|s| s.public_key == *public_key);
                    if dead {
                        Status::Deleted
                    } else if bootstrap || signed {
                        set.approved.insert(
                            log.id,
                            Master {
                                user_id: *user_id,
                                public_key: *public_key,
                            },
                        );
                        Status::Alive
                    } else {
                        set.pending.insert(*user_id);
                        Status::Pending
                    }
                }
                OpKind::RevokeMaster { target, .. } => {
                    if signed {
                        revoked.insert(*target);
                        if set.approved.remove(target).is_some() {
                            set.derived.insert(*target, Status::Deleted);
                        }
                        Status::Alive
                    } else {
                        Status::Pending
                    }
                }
                OpKind::DeleteEntity => {
                    if signed {
                        set.entity_deleted = true;
                        Status::Alive
                    } else {
                        Status::Pending
                    }
                }
                // not a master op; validation of the category rejects it earlier
                _ => Status::Failed,
            };
            set.derived.insert(log.id, status);
        }
        set
    }

    /// Distinct approved signers among `signs`. With `before`, only approvals
    /// from master-oplogs older than it count.
    fn count_signers(&self, signs: &[SignInfo], before: Option<LogId>) -> (Option<LogId>, usize) {
        let mut signers = HashSet::new();
        let mut first = None;
        for sign in signs {
            let Some(master_log_id) = sign.master_log_id else {
                continue;
            };
            if before.is_some_and(|b| master_log_id >= b) {
                continue;
            }
            let Some(master) = self.approved.get(&master_log_id) else {
                continue;
            };
            if master.user_id == sign.signer_id
                && master.public_key == sign.public_key
                && signers.insert(sign.signer_id)
            {
                first.get_or_insert(master_log_id);
            }
        }
        (first, signers.len())
    }

    /// `(master log id, distinct approved signers, threshold met)`
    pub fn is_valid_internal_oplog(&self, signs: &[SignInfo]) -> (Option<LogId>, usize, bool) {
        let (master_log_id, count) = self.count_signers(signs, None);
        (master_log_id, count, count >= self.threshold)
    }

    /// Status a non-master oplog deserves under the current master set
    pub fn evaluate(&self, oplog: &Oplog) -> Verdict {
        let (master_log_id, _, ok) = self.is_valid_internal_oplog(&oplog.master_signs);
        if ok {
            return Verdict {
                status: Status::Alive,
                master_log_id,
            };
        }

        let mut waiting = oplog.master_signs.is_empty();
        let mut revoked = false;
        for sign in &oplog.master_signs {
            let Some(id) = sign.master_log_id else {
                continue;
            };
            match self.known.get(&id) {
                None => waiting = true,
                Some(_) if self.approved.contains_key(&id) => waiting = true,
                Some(_) if self.derived.get(&id) == Some(&Status::Pending) => waiting = true,
                Some(_) => revoked = true,
            }
        }
        let status = if revoked && !waiting {
            Status::Failed
        } else {
            Status::Pending
        };
        Verdict {
            status,
            master_log_id: None,
        }
    }

    /// Status the master-oplog `id` should have, if it was part of the scan
    pub fn derived_status(&self, id: &LogId) -> Option<Status> {
        self.derived.get(id).copied()
    }

    pub fn is_master(&self, user: &UserId) -> bool {
        self.approved.values().any(|m| m.user_id == *user)
    }

    /// Newest master-oplog approving `user`
    pub fn approving_log(&self, user: &UserId) -> Option<LogId> {
        self.approved
            .iter()
            .rev()
            .find(|(_, m)| m.user_id == *user)
            .map(|(id, _)| *id)
    }

    /// Users with an `AddMaster` still waiting for signatures
    pub fn is_pending_master(&self, user: &UserId) -> bool {
        self.pending.contains(user) && !self.is_master(user)
    }

    pub fn masters(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.approved.values().map(|m| m.user_id).collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn is_entity_deleted(&self) -> bool {
        self.entity_deleted
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Everything a joiner needs to bootstrap its replica, produced by `approve_join`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveJoin {
    pub record: EntityRecord,
    pub master_logs: Vec<Oplog>,
    pub member_logs: Vec<Oplog>,
    pub op_key_logs: Vec<Oplog>,
    /// Currently active op-key
    pub op_key: Option<KeyInfo>,
    pub join_key: Option<KeyInfo>,
}
