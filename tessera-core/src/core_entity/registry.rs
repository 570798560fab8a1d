//! Entity registry: entity id → protocol manager

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::protocol_manager::EntityProtocolManager;
use crate::core_oplog::EntityId;

#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<EntityId, Arc<EntityProtocolManager>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntityId) -> Option<Arc<EntityProtocolManager>> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the previous manager for this id, if any
    pub fn insert(&self, pm: Arc<EntityProtocolManager>) -> Option<Arc<EntityProtocolManager>> {
        use super::traits::Entity;
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pm.id(), pm)
    }

    pub fn remove(&self, id: &EntityId) -> Option<Arc<EntityProtocolManager>> {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Snapshot of all managers
    pub fn all(&self) -> Vec<Arc<EntityProtocolManager>> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
