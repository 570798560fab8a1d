//! Conflict resolution between oplogs racing for the same target

use super::oplog::Oplog;
use super::types::{LogId, Status, Timestamp};

/// Precedence of an oplog over its rivals, compared lexicographically:
/// status rank, then master-signed, then update time, then LogId.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub status: Status,
    pub master_signed: bool,
    pub update_ts: Timestamp,
    pub id: LogId,
}

impl OrderKey {
    pub fn of(oplog: &Oplog) -> Self {
        OrderKey {
            status: oplog.status,
            master_signed: oplog.is_master_signed(),
            update_ts: oplog.update_ts,
            id: oplog.id,
        }
    }
}

/// True when `candidate` should replace `current` as the visible version
pub fn wins(candidate: &Oplog, current: &Oplog) -> bool {
    OrderKey::of(candidate) > OrderKey::of(current)
}

/// Apply a status transition. Status never regresses and `Failed` is terminal.
pub fn advance_status(current: Status, to: Status) -> Status {
    if current == Status::Failed {
        Status::Failed
    } else {
        current.max(to)
    }
}

/// Result of merging one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New or changed records now Alive or Deleted
    pub applied: Vec<LogId>,
    /// Stored, but lost the tie-break for their target
    pub conflicts: Vec<LogId>,
    /// Waiting for master information or signatures
    pub pending: Vec<LogId>,
    /// Rejected by validation; never retried
    pub failed: Vec<LogId>,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.conflicts.is_empty()
            && self.pending.is_empty()
            && self.failed.is_empty()
    }

    pub fn extend(&mut self, other: MergeOutcome) {
        self.applied.extend(other.applied);
        self.conflicts.extend(other.conflicts);
        self.pending.extend(other.pending);
        self.failed.extend(other.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::UserId;
    use crate::core_oplog::oplog::OpKind;
    use crate::core_oplog::types::{EntityId, ObjectId};
    use proptest::prelude::*;

    const STATUSES: [Status; 5] = [
        Status::Failed,
        Status::Internal,
        Status::Pending,
        Status::Alive,
        Status::Deleted,
    ];

    fn oplog(status: Status, signed: bool, ts: u64, id: LogId) -> Oplog {
        let mut log = Oplog::new(
            EntityId::new(),
            OpKind::DeleteObject { object_id: ObjectId::new() },
            UserId::from_bytes([1u8; 32]),
            Timestamp::from_micros(ts),
        );
        log.id = id;
        log.status = status;
        log.master_log_id = signed.then(|| LogId::from_bytes([9u8; 16]));
        log
    }

    fn arb_oplog() -> impl Strategy<Value = Oplog> {
        (0usize..5, any::<bool>(), 0u64..4, any::<[u8; 16]>()).prop_map(|(s, signed, ts, id)| {
            oplog(STATUSES[s], signed, ts, LogId::from_bytes(id))
        })
    }

    #[test]
    fn test_higher_status_beats_signature_and_time() {
        let id = LogId::from_bytes([0u8; 16]);
        let alive = oplog(Status::Alive, false, 1, id);
        let pending = oplog(Status::Pending, true, 100, LogId::from_bytes([1u8; 16]));
        assert!(wins(&alive, &pending));
    }

    #[test]
    fn test_signed_beats_unsigned_at_same_status() {
        let signed = oplog(Status::Alive, true, 1, LogId::from_bytes([0u8; 16]));
        let unsigned = oplog(Status::Alive, false, 100, LogId::from_bytes([1u8; 16]));
        assert!(wins(&signed, &unsigned));
    }

    #[test]
    fn test_two_signed_race_on_time_then_id() {
        let early = oplog(Status::Alive, true, 1, LogId::from_bytes([5u8; 16]));
        let late = oplog(Status::Alive, true, 2, LogId::from_bytes([0u8; 16]));
        assert!(wins(&late, &early));

        let a = oplog(Status::Alive, true, 2, LogId::from_bytes([1u8; 16]));
        let b = oplog(Status::Alive, true, 2, LogId::from_bytes([2u8; 16]));
        assert!(wins(&b, &a));
        assert!(!wins(&a, &b));
    }

    #[test]
    fn test_status_never_regresses() {
        assert_eq!(advance_status(Status::Alive, Status::Pending), Status::Alive);
        assert_eq!(advance_status(Status::Pending, Status::Alive), Status::Alive);
        assert_eq!(advance_status(Status::Failed, Status::Alive), Status::Failed);
        assert_eq!(advance_status(Status::Alive, Status::Deleted), Status::Deleted);
    }

    proptest! {
        #[test]
        fn prop_order_is_total_and_antisymmetric(a in arb_oplog(), b in arb_oplog()) {
            let (ka, kb) = (OrderKey::of(&a), OrderKey::of(&b));
            if a.id != b.id {
                prop_assert!(wins(&a, &b) ^ wins(&b, &a));
            }
            prop_assert_eq!(ka.cmp(&kb), kb.cmp(&ka).reverse());
        }

        #[test]
        fn prop_precedence_rules(a in arb_oplog(), b in arb_oplog()) {
            prop_assume!(a.id != b.id);
            if a.status > b.status {
                prop_assert!(wins(&a, &b));
            }
            if a.status == b.status && a.is_master_signed() && !b.is_master_signed() {
                prop_assert!(wins(&a, &b));
            }
            if a.status == b.status
                && a.is_master_signed() == b.is_master_signed()
                && a.update_ts > b.update_ts
            {
                prop_assert!(wins(&a, &b));
            }
        }

        #[test]
        fn prop_order_is_transitive(a in arb_oplog(), b in arb_oplog(), c in arb_oplog()) {
            if wins(&a, &b) && wins(&b, &c) {
                prop_assert!(wins(&a, &c));
            }
        }

        #[test]
        fn prop_advance_is_monotone(s in 0usize..5, t in 0usize..5) {
            let (from, to) = (STATUSES[s], STATUSES[t]);
            let next = advance_status(from, to);
            prop_assert!(next >= from);
        }
    }
}
