//! Insertion-ordered entity table plus the set of entities still uploading.

use crate::entity::EntityHandle;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Default)]
struct RegistryState {
    order: Vec<Uuid>,
    entities: HashMap<Uuid, EntityHandle>,
    incomplete: HashSet<Uuid>,
}

/// All loaded entities of one scene behind a single lock.
///
/// Callers never hold the lock while drawing or talking to the GPU; they take a
/// [`Registry::snapshot`] of handles and work on those.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds (or replaces) an entity. `incomplete` queues it for partial preparation.
    pub fn insert(&self, id: Uuid, handle: EntityHandle, incomplete: bool) {
        let mut state = self.lock();
        if state.entities.insert(id, handle).is_none() {
            state.order.push(id);
        }
        if incomplete {
            state.incomplete.insert(id);
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<EntityHandle> {
        let mut state = self.lock();
        let handle = state.entities.remove(&id)?;
        state.order.retain(|other| *other != id);
        state.incomplete.remove(&id);
        Some(handle)
    }

    pub fn get(&self, id: Uuid) -> Option<EntityHandle> {
        self.lock().entities.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().order.clone()
    }

    /// Handles in insertion order.
    pub fn snapshot(&self) -> Vec<EntityHandle> {
        let state = self.lock();
        state.order.iter().filter_map(|id| state.entities.get(id).cloned()).collect()
    }

    /// Re-queues a registered entity for partial preparation.
    pub fn mark_incomplete(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.entities.contains_key(&id) {
            return false;
        }
        state.incomplete.insert(id);
        true
    }

    pub fn incomplete(&self) -> Vec<(Uuid, EntityHandle)> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter(|id| state.incomplete.contains(id))
            .filter_map(|id| state.entities.get(id).map(|handle| (*id, handle.clone())))
            .collect()
    }

    pub fn has_incomplete(&self) -> bool {
        !self.lock().incomplete.is_empty()
    }

    /// Drops `id` from the incomplete set. Returns true when that emptied the set.
    pub fn complete(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        state.incomplete.remove(&id) && state.incomplete.is_empty()
    }
}
