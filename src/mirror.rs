//! Optional offline-readable copy of entities.
//!
//! Save, fetch and delete call into the mirror after they succeed. Mirror
//! failures are logged by the caller and never change the outcome of the
//! remote operation.

use crate::core::Result;
use crate::entity::Entity;
use crate::state::EntityState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait LocalMirror: Send + Sync {
    /// The last persisted snapshot of `entity`, if any.
    async fn fetch_local_copy(&self, entity: &Entity) -> Result<Option<EntityState>>;

    async fn persist(&self, entity: &Entity) -> Result<()>;

    async fn delete(&self, entity: &Entity) -> Result<()>;

    /// Moves the copy stored under a local id to the server id the entity
    /// was just given.
    async fn reassign_identity(&self, entity: &Entity, local_id: &str, object_id: &str)
    -> Result<()>;
}

/// Mirror that keeps snapshots in a map keyed by class and id.
#[derive(Default)]
pub struct InMemoryMirror {
    copies: Mutex<HashMap<(String, String), EntityState>>,
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn copies(&self) -> MutexGuard<'_, HashMap<(String, String), EntityState>> {
        self.copies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, class_name: &str, id: &str) -> Option<EntityState> {
        self.copies()
            .get(&(class_name.to_string(), id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.copies().len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies().is_empty()
    }
}

fn mirror_key(entity: &Entity) -> Option<(String, String)> {
    let id = entity.object_id().or_else(|| entity.existing_local_id())?;
    Some((entity.class_name(), id))
}

#[async_trait]
impl LocalMirror for InMemoryMirror {
    async fn fetch_local_copy(&self, entity: &Entity) -> Result<Option<EntityState>> {
        Ok(mirror_key(entity).and_then(|key| self.copies().get(&key).cloned()))
    }

    async fn persist(&self, entity: &Entity) -> Result<()> {
        let key = match mirror_key(entity) {
            Some(key) => key,
            None => (entity.class_name(), entity.local_id()),
        };
        let snapshot = entity.estimated_state()?;
        self.copies().insert(key, snapshot);
        Ok(())
    }

    async fn delete(&self, entity: &Entity) -> Result<()> {
        if let Some(key) = mirror_key(entity) {
            self.copies().remove(&key);
        }
        Ok(())
    }

    async fn reassign_identity(
        &self,
        entity: &Entity,
        local_id: &str,
        object_id: &str,
    ) -> Result<()> {
        let class_name = entity.class_name();
        let mut copies = self.copies();
        if let Some(state) = copies.remove(&(class_name.clone(), local_id.to_string())) {
            copies.insert((class_name, object_id.to_string()), state);
        }
        Ok(())
    }
}
