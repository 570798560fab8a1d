//! Route-hash → entity tables for op-keys and join-keys
//!
//! Lock contract: methods on `KeyTables` acquire the tables' lock themselves and
//! must not be called while a `KeyTablesWrite` from the same tables is alive.
//! Code that already holds the lock (a bulk resync of one entity) calls the same
//! operations on the `KeyTablesWrite` guard instead.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use crate::core_entity::{KeyInfo, RouteHash};
use crate::core_oplog::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub entity_id: EntityId,
    pub key: KeyInfo,
}

#[derive(Default)]
struct Tables {
    ops: HashMap<RouteHash, KeyEntry>,
    joins: HashMap<RouteHash, KeyEntry>,
}

#[derive(Default)]
pub struct KeyTables {
    inner: RwLock<Tables>,
}

/// Exclusive access to both tables
pub struct KeyTablesWrite<'a> {
    tables: RwLockWriteGuard<'a, Tables>,
}

impl KeyTablesWrite<'_> {
    pub fn add_op_key(&mut self, entity_id: EntityId, key: KeyInfo) {
        self.tables
            .ops
            .insert(key.route_hash(), KeyEntry { entity_id, key });
    }

    pub fn add_join_key(&mut self, entity_id: EntityId, key: KeyInfo) {
        self.tables
            .joins
            .insert(key.route_hash(), KeyEntry { entity_id, key });
    }

    pub fn remove_op_key(&mut self, hash: &RouteHash) -> Option<KeyEntry> {
        self.tables.ops.remove(hash)
    }

    /// Forget every key of `entity_id`; returns how many were removed
    pub fn remove_entity(&mut self, entity_id: &EntityId) -> usize {
        let before = self.tables.ops.len() + self.tables.joins.len();
        self.tables.ops.retain(|_, e| e.entity_id != *entity_id);
        self.tables.joins.retain(|_, e| e.entity_id != *entity_id);
        before - self.tables.ops.len() - self.tables.joins.len()
    }
}

impl KeyTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self) -> KeyTablesWrite<'_> {
        KeyTablesWrite {
            tables: self.inner.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn op(&self, hash: &RouteHash) -> Option<KeyEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ops
            .get(hash)
            .cloned()
    }

    pub fn join(&self, hash: &RouteHash) -> Option<KeyEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .joins
            .get(hash)
            .cloned()
    }

    /// Replace everything known about `entity_id` with the given keys
    pub fn sync_entity(&self, entity_id: EntityId, op_keys: Vec<KeyInfo>, join_key: Option<KeyInfo>) {
        let mut tables = self.write();
        tables.remove_entity(&entity_id);
        for key in op_keys {
            tables.add_op_key(entity_id, key);
        }
        if let Some(key) = join_key {
            tables.add_join_key(entity_id, key);
        }
    }

    pub fn remove_entity(&self, entity_id: &EntityId) -> usize {
        self.write().remove_entity(entity_id)
    }

    pub fn op_len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).ops.len()
    }

    pub fn join_len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).joins.len()
    }
}
