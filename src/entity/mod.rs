//! Entity handles: optimistic local state over a server-confirmed snapshot.
//!
//! An entity keeps the last confirmed [`EntityState`], the generations of
//! operations handed to saves that have not resolved yet, and the current
//! operation set collecting new edits. The estimated data readers see is the
//! confirmed data with every pending generation and the current set applied.

mod save;

use crate::client::ClientCore;
use crate::core::{FileRef, Relation, Result, SyncError, Value};
use crate::ops::{FieldOperation, OperationSet};
use crate::state::{EntityState, EntityStateBuilder};
use crate::task_queue::TaskQueue;
use chrono::{DateTime, Utc};
use im::OrdMap;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Level, event};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Keys managed by the server that callers may not write.
const READ_ONLY_KEYS: [&str; 4] = ["objectId", "createdAt", "updatedAt", "sessionToken"];

pub type SaveListener = Arc<dyn Fn(&Entity) + Send + Sync>;

pub(crate) struct EntityInner {
    client: Arc<ClientCore>,
    class_name: String,
    /// Stable order used when several entity queues are locked together.
    sequence: u64,
    /// Copy of the confirmed object id, readable without the data lock so
    /// identity comparisons never wait on (or re-enter) an entity's lock.
    object_id: Mutex<Option<String>>,
    data: Mutex<EntityData>,
    queue: TaskQueue,
}

struct EntityData {
    state: Arc<EntityState>,
    /// In-flight generations, oldest first.
    pending: VecDeque<OperationSet>,
    current: OperationSet,
    estimated: OrdMap<String, Value>,
    local_id: Option<String>,
    deleting: usize,
    is_deleted: bool,
    listeners: Vec<(u64, SaveListener)>,
    next_listener_id: u64,
}

impl EntityData {
    fn operation_sets(&self) -> impl Iterator<Item = &OperationSet> {
        self.pending.iter().chain(std::iter::once(&self.current))
    }

    fn rebuild_estimated(&mut self) {
        let mut estimated = self.state.data().clone();
        for set in self.operation_sets() {
            for (key, op) in set.iter() {
                match op.apply(estimated.get(key), key) {
                    Ok(Some(value)) => {
                        estimated.insert(key.to_string(), value);
                    }
                    Ok(None) => {
                        estimated.remove(key);
                    }
                    Err(err) => {
                        event!(
                            Level::WARN,
                            key,
                            error = %err,
                            "pending operation no longer applies to confirmed data"
                        );
                    }
                }
            }
        }
        self.estimated = estimated;
    }

    fn is_available(&self, key: &str) -> bool {
        self.state.is_complete()
            || self.state.available_keys().contains(key)
            || self.estimated.contains_key(key)
            || self.operation_sets().any(|set| set.contains_key(key))
    }
}

/// A handle to one record. Clones share the same underlying entity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn from_state(client: Arc<ClientCore>, state: EntityState) -> Self {
        let object_id = state.object_id().map(str::to_string);
        let mut data = EntityData {
            state: Arc::new(state.clone()),
            pending: VecDeque::new(),
            current: OperationSet::new(),
            estimated: OrdMap::new(),
            local_id: None,
            deleting: 0,
            is_deleted: false,
            listeners: Vec::new(),
            next_listener_id: 1,
        };
        data.rebuild_estimated();
        Self {
            inner: Arc::new(EntityInner {
                client,
                class_name: state.class_name().to_string(),
                sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
                object_id: Mutex::new(object_id),
                data: Mutex::new(data),
                queue: TaskQueue::new(),
            }),
        }
    }

    /// A brand-new entity: no server id, every key considered available.
    pub(crate) fn new(client: Arc<ClientCore>, class_name: &str) -> Self {
        let state = EntityStateBuilder::new(class_name).complete(true).build();
        Self::from_state(client, state)
    }

    /// A placeholder for an existing server object whose data is not loaded.
    pub(crate) fn reference(client: Arc<ClientCore>, class_name: &str, object_id: &str) -> Self {
        let state = EntityStateBuilder::new(class_name)
            .object_id(Some(object_id.to_string()))
            .build();
        Self::from_state(client, state)
    }

    fn lock(&self) -> MutexGuard<'_, EntityData> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, data: &mut EntityData, state: EntityState) {
        *self
            .inner
            .object_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state.object_id().map(str::to_string);
        data.state = Arc::new(state);
        data.rebuild_estimated();
    }

    pub(crate) fn client(&self) -> &Arc<ClientCore> {
        &self.inner.client
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    pub(crate) fn task_queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn class_name(&self) -> String {
        self.inner.class_name.clone()
    }

    pub fn object_id(&self) -> Option<String> {
        self.inner
            .object_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.lock().state.created_at()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.lock().state.updated_at()
    }

    pub fn is_principal(&self) -> bool {
        self.lock().state.kind().is_principal()
    }

    pub fn session_token(&self) -> Option<String> {
        self.lock().state.session_token().map(str::to_string)
    }

    /// Same handle, or same class and server id.
    pub fn same_identity(&self, other: &Entity) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        if self.inner.class_name != other.inner.class_name {
            return false;
        }
        match (self.object_id(), other.object_id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The local id standing in for this entity until it has a server id,
    /// created on first use.
    pub fn local_id(&self) -> String {
        let mut data = self.lock();
        if let Some(local_id) = &data.local_id {
            return local_id.clone();
        }
        let local_id = self.inner.client.local_ids.create_local_id();
        data.local_id = Some(local_id.clone());
        local_id
    }

    pub fn existing_local_id(&self) -> Option<String> {
        self.lock().local_id.clone()
    }

    /// The last server-confirmed snapshot.
    pub fn state(&self) -> Arc<EntityState> {
        self.lock().state.clone()
    }

    /// The confirmed snapshot with every pending operation applied.
    pub fn estimated_state(&self) -> Result<EntityState> {
        let data = self.lock();
        let mut builder = data.state.builder();
        for set in data.operation_sets() {
            builder = builder.apply_operations(set)?;
        }
        Ok(builder.build())
    }

    // ----- mutation -------------------------------------------------------

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() || READ_ONLY_KEYS.contains(&key) {
            return Err(SyncError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Applies `op` to the estimated data and merges it into the current
    /// operation set. Nothing changes if either step fails.
    fn perform_operation(&self, key: &str, op: FieldOperation) -> Result<()> {
        let mut data = self.lock();
        let merged = op.merge_with_previous(data.current.get(key))?;
        let updated = op.apply(data.estimated.get(key), key)?;
        match updated {
            Some(value) => {
                data.estimated.insert(key.to_string(), value);
            }
            None => {
                data.estimated.remove(key);
            }
        }
        data.current.put(key, merged);
        Ok(())
    }

    pub fn put(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        Self::validate_key(key)?;
        let value = value.into();
        value.validate_storable()?;
        self.perform_operation(key, FieldOperation::Set(value))
    }

    /// Deletes the field.
    pub fn remove(&self, key: &str) -> Result<()> {
        Self::validate_key(key)?;
        self.perform_operation(key, FieldOperation::Delete)
    }

    pub fn increment(&self, key: &str, amount: impl Into<Value>) -> Result<()> {
        Self::validate_key(key)?;
        self.perform_operation(key, FieldOperation::increment(amount)?)
    }

    pub fn add(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.add_all(key, vec![value.into()])
    }

    pub fn add_all(&self, key: &str, values: Vec<Value>) -> Result<()> {
        Self::validate_key(key)?;
        validate_values(&values)?;
        self.perform_operation(key, FieldOperation::Add(values))
    }

    pub fn add_unique(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.add_all_unique(key, vec![value.into()])
    }

    pub fn add_all_unique(&self, key: &str, values: Vec<Value>) -> Result<()> {
        Self::validate_key(key)?;
        validate_values(&values)?;
        self.perform_operation(key, FieldOperation::AddUnique(values))
    }

    /// Removes every occurrence of each value from the list field.
    pub fn remove_all(&self, key: &str, values: Vec<Value>) -> Result<()> {
        Self::validate_key(key)?;
        validate_values(&values)?;
        self.perform_operation(key, FieldOperation::Remove(values))
    }

    pub fn add_relation(&self, key: &str, entity: &Entity) -> Result<()> {
        Self::validate_key(key)?;
        self.perform_operation(key, FieldOperation::relation(vec![entity.clone()], Vec::new())?)
    }

    pub fn remove_relation(&self, key: &str, entity: &Entity) -> Result<()> {
        Self::validate_key(key)?;
        self.perform_operation(key, FieldOperation::relation(Vec::new(), vec![entity.clone()])?)
    }

    // ----- reads ----------------------------------------------------------

    /// The estimated value of `key`.
    ///
    /// Fails with [`SyncError::DataUnavailable`] for a key the entity has
    /// never loaded; fetch it first.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let data = self.lock();
        if !data.is_available(key) {
            return Err(SyncError::DataUnavailable(key.to_string()));
        }
        Ok(data.estimated.get(key).cloned())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key)?.and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key)?.and_then(|v| v.as_i64()))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get(key)?.and_then(|v| v.as_f64()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get(key)?.and_then(|v| v.as_bool()))
    }

    pub fn get_date(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get(key)?.and_then(|v| v.as_date()))
    }

    pub fn get_list(&self, key: &str) -> Result<Option<Vec<Value>>> {
        Ok(self.get(key)?.and_then(|v| v.as_list().map(<[Value]>::to_vec)))
    }

    pub fn get_entity(&self, key: &str) -> Result<Option<Entity>> {
        Ok(self.get(key)?.and_then(|v| v.as_entity().cloned()))
    }

    pub fn get_file(&self, key: &str) -> Result<Option<FileRef>> {
        Ok(self.get(key)?.and_then(|v| v.as_file().cloned()))
    }

    /// The relation stored under `key`, or an empty one.
    pub fn get_relation(&self, key: &str) -> Result<Relation> {
        match self.get(key)? {
            Some(Value::Relation(relation)) => Ok(relation),
            None | Some(Value::Null) => Ok(Relation::default()),
            Some(other) => Err(SyncError::InvalidValue(format!(
                "Field '{}' holds {}, not a relation",
                key,
                other.type_name()
            ))),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().estimated.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().estimated.keys().cloned().collect()
    }

    pub fn estimated_data(&self) -> OrdMap<String, Value> {
        self.lock().estimated.clone()
    }

    /// Whether the entity holds all of its fields.
    pub fn is_data_available(&self) -> bool {
        self.lock().state.is_complete()
    }

    pub fn is_data_available_for(&self, key: &str) -> bool {
        self.lock().is_available(key)
    }

    // ----- change tracking ------------------------------------------------

    /// True when the entity has no server id, has unsaved edits, or reaches
    /// a dirty entity or unsaved file through its estimated data.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty_within(&mut HashSet::new())
    }

    fn is_dirty_within(&self, visited: &mut HashSet<u64>) -> bool {
        if !visited.insert(self.sequence()) {
            return false;
        }
        let children = {
            let data = self.lock();
            if data.state.object_id().is_none() || !data.current.is_empty() {
                return true;
            }
            data.estimated.clone()
        };
        children
            .values()
            .any(|value| value_has_dirty_child(value, visited))
    }

    /// Dirty considering only this entity, not what it references.
    pub(crate) fn is_dirty_self(&self) -> bool {
        let data = self.lock();
        data.state.object_id().is_none() || !data.current.is_empty()
    }

    pub fn is_dirty_key(&self, key: &str) -> bool {
        self.lock().current.contains_key(key)
    }

    pub fn has_changes(&self) -> bool {
        !self.lock().current.is_empty()
    }

    /// Discards unsaved edits to `key`.
    pub fn revert(&self, key: &str) {
        let mut data = self.lock();
        if data.current.remove(key).is_some() {
            data.rebuild_estimated();
        }
    }

    /// Discards every unsaved edit.
    pub fn revert_all(&self) {
        let mut data = self.lock();
        data.current.clear();
        data.rebuild_estimated();
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().is_deleted
    }

    pub fn is_deleting(&self) -> bool {
        self.lock().deleting > 0
    }

    /// Number of operation sets queued, the current one included.
    pub fn pending_generations(&self) -> usize {
        self.lock().pending.len() + 1
    }

    /// Registers a callback run after every successful save. Returns an id
    /// for [`Entity::remove_save_listener`].
    pub fn add_save_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&Entity) + Send + Sync + 'static,
    {
        let mut data = self.lock();
        let id = data.next_listener_id;
        data.next_listener_id += 1;
        data.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_save_listener(&self, id: u64) -> bool {
        let mut data = self.lock();
        let before = data.listeners.len();
        data.listeners.retain(|(listener_id, _)| *listener_id != id);
        data.listeners.len() != before
    }

    // ----- save bookkeeping -----------------------------------------------

    /// Captures the current operation set as an in-flight generation and
    /// opens a fresh one for further edits.
    pub fn start_save(&self) -> OperationSet {
        let mut data = self.lock();
        let captured = std::mem::take(&mut data.current);
        data.pending.push_back(captured.clone());
        captured
    }

    /// Like [`Entity::start_save`] but marks the generation as owned by the
    /// command cache, so failed live saves do not merge into it.
    pub(crate) fn start_save_later(&self) -> OperationSet {
        let mut data = self.lock();
        let mut captured = std::mem::take(&mut data.current);
        captured.mark_save_later();
        data.pending.push_back(captured.clone());
        captured
    }

    /// Resolves the generation `sent` once its save has an outcome.
    ///
    /// On success the result is folded into the confirmed state and save
    /// listeners run. On failure (`None`) the generation's operations move
    /// into the next generation still owned by this process, so the next
    /// save retries them. Queued generations in between keep precedence
    /// over the failed edits. Unknown generations are ignored, which makes a
    /// second call for the same save harmless.
    pub fn handle_save_result(&self, result: Option<EntityState>, sent: &OperationSet) -> Result<()> {
        let (listeners, learned) = {
            let mut data = self.lock();
            let Some(index) = data.pending.iter().position(|set| set.id() == sent.id()) else {
                return Ok(());
            };
            let Some(generation) = data.pending.remove(index) else {
                return Ok(());
            };

            let Some(result) = result else {
                let target = (index..data.pending.len()).find(|&i| !data.pending[i].is_save_later());
                let end = target.unwrap_or(data.pending.len());
                let carried = {
                    let skipped: Vec<&OperationSet> = data.pending.range(index..end).collect();
                    carry_past(&generation, &skipped)
                };
                match target {
                    Some(i) => merge_forward(&mut data.pending[i], &carried),
                    None => merge_forward(&mut data.current, &carried),
                }
                data.rebuild_estimated();
                return Ok(());
            };

            let previous_id = data.state.object_id().map(str::to_string);
            let next = if result.is_complete() {
                result
            } else {
                data.state
                    .builder()
                    .apply_operations(&generation)?
                    .apply_state(&result)
                    .build()
            };
            self.set_state(&mut data, next);

            let learned = match (previous_id, data.state.object_id(), &data.local_id) {
                (None, Some(object_id), Some(local_id)) => {
                    Some((local_id.clone(), object_id.to_string()))
                }
                _ => None,
            };
            let listeners: Vec<SaveListener> =
                data.listeners.iter().map(|(_, l)| l.clone()).collect();
            (listeners, learned)
        };

        if let Some((local_id, object_id)) = learned {
            self.inner.client.local_ids.set_object_id(&local_id, &object_id)?;
        }
        for listener in listeners {
            listener(self);
        }
        Ok(())
    }

    /// Folds a fetched state in. A complete state replaces the confirmed
    /// one; a partial state only adds to it.
    pub fn merge_from_server(&self, fetched: EntityState) {
        let mut data = self.lock();
        let next = if fetched.is_complete() {
            let token = data.state.session_token().map(str::to_string);
            let mut builder = fetched.builder();
            if fetched.session_token().is_none() {
                builder = builder.session_token(token);
            }
            builder.build()
        } else {
            data.state.builder().apply_state(&fetched).build()
        };
        self.set_state(&mut data, next);
    }

    pub(crate) fn begin_delete(&self) {
        self.lock().deleting += 1;
    }

    pub fn handle_delete_result(&self, deleted: bool) {
        let mut data = self.lock();
        data.deleting = data.deleting.saturating_sub(1);
        if deleted {
            data.is_deleted = true;
        }
    }
}

fn validate_values(values: &[Value]) -> Result<()> {
    values.iter().try_for_each(Value::validate_storable)
}

/// Rewrites a failed generation so it can be replayed after `skipped`, the
/// queued generations that followed it and must stay as they are.
///
/// A key that a skipped generation sets or deletes is dropped. A set or
/// delete followed by relative edits is folded with them into a single set
/// of the combined value.
fn carry_past(failed: &OperationSet, skipped: &[&OperationSet]) -> OperationSet {
    let mut carried = OperationSet::new();
    'keys: for (key, failed_op) in failed.iter() {
        let mut op = failed_op.clone();
        for queued in skipped {
            let Some(newer) = queued.get(key) else {
                continue;
            };
            if matches!(newer, FieldOperation::Set(_) | FieldOperation::Delete) {
                continue 'keys;
            }
            if matches!(op, FieldOperation::Set(_) | FieldOperation::Delete) {
                op = match newer.merge_with_previous(Some(&op)) {
                    Ok(folded) => folded,
                    Err(err) => {
                        event!(Level::WARN, key, error = %err, "dropping failed operation superseded by a queued edit");
                        continue 'keys;
                    }
                };
            }
        }
        carried.put(key, op);
    }
    carried
}

/// Merges a failed generation into `target`, which is newer. A key whose
/// operations cannot be combined keeps the newer operation.
fn merge_forward(target: &mut OperationSet, failed: &OperationSet) {
    for (key, failed_op) in failed.iter() {
        let merged = match target.get(key) {
            None => Ok(failed_op.clone()),
            Some(newer) => newer.merge_with_previous(Some(failed_op)),
        };
        match merged {
            Ok(op) => target.put(key, op),
            Err(err) => {
                event!(Level::WARN, key, error = %err, "dropping failed operation superseded by a newer edit");
            }
        }
    }
}

fn value_has_dirty_child(value: &Value, visited: &mut HashSet<u64>) -> bool {
    match value {
        Value::Entity(entity) => entity.is_dirty_within(visited),
        Value::File(file) => file.is_dirty(),
        Value::List(items) => items.iter().any(|item| value_has_dirty_child(item, visited)),
        Value::Map(map) => map.values().any(|item| value_has_dirty_child(item, visited)),
        _ => false,
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("class_name", &self.inner.class_name)
            .field("object_id", &self.object_id())
            .finish()
    }
}
