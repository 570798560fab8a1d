//! Keyed resource lock
//!
//! `lock(id)` blocks while another guard for the same id is alive. Different ids never
//! contend. Guards release on drop.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct KeyedLock {
    held: Mutex<HashSet<Vec<u8>>>,
    released: Condvar,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, id: &[u8]) -> KeyedGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(id) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(id.to_vec());

        KeyedGuard {
            owner: self,
            id: id.to_vec(),
        }
    }

    /// Non-blocking variant; `None` when the id is already held
    pub fn try_lock(&self, id: &[u8]) -> Option<KeyedGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(id.to_vec()) {
            return None;
        }
        Some(KeyedGuard {
            owner: self,
            id: id.to_vec(),
        })
    }

    pub fn is_locked(&self, id: &[u8]) -> bool {
        self.held_set().contains(id)
    }

    fn held_set(&self) -> MutexGuard<'_, HashSet<Vec<u8>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLock,
    id: Vec<u8>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.owner.held_set().remove(&self.id);
        self.owner.released.notify_all();
    }
}
