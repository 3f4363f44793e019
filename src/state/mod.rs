//! Immutable, server-confirmed entity snapshots.

use crate::core::{Result, Value};
use crate::ops::OperationSet;
use chrono::{DateTime, Utc};
use im::{OrdMap, OrdSet};

/// Class name of principal records (accounts), which are created through a
/// dedicated endpoint rather than the generic class endpoint.
pub const PRINCIPAL_CLASS: &str = "_User";

/// Kind-specific data carried alongside the common state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntityKind {
    #[default]
    Record,
    Principal { session_token: Option<String> },
}

impl EntityKind {
    pub fn for_class(class_name: &str) -> Self {
        if class_name == PRINCIPAL_CLASS {
            Self::Principal {
                session_token: None,
            }
        } else {
            Self::Record
        }
    }

    pub fn is_principal(&self) -> bool {
        matches!(self, Self::Principal { .. })
    }

    fn merged_with(&self, other: &EntityKind) -> EntityKind {
        match (self, other) {
            (
                Self::Principal { session_token },
                Self::Principal {
                    session_token: incoming,
                },
            ) => Self::Principal {
                session_token: incoming.clone().or_else(|| session_token.clone()),
            },
            (current, _) => current.clone(),
        }
    }
}

/// A server-confirmed snapshot. Never mutated after it is built; replaced
/// wholesale through [`EntityStateBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    class_name: String,
    object_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    data: OrdMap<String, Value>,
    complete: bool,
    available_keys: OrdSet<String>,
    kind: EntityKind,
}

impl EntityState {
    pub fn new(class_name: impl Into<String>) -> Self {
        EntityStateBuilder::new(class_name).build()
    }

    pub fn builder(&self) -> EntityStateBuilder {
        EntityStateBuilder::from_state(self)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn data(&self) -> &OrdMap<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn available_keys(&self) -> &OrdSet<String> {
        &self.available_keys
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn session_token(&self) -> Option<&str> {
        match &self.kind {
            EntityKind::Principal { session_token } => session_token.as_deref(),
            EntityKind::Record => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityStateBuilder {
    class_name: String,
    object_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    data: OrdMap<String, Value>,
    complete: bool,
    available_keys: OrdSet<String>,
    kind: EntityKind,
}

impl EntityStateBuilder {
    pub fn new(class_name: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self {
            kind: EntityKind::for_class(&class_name),
            class_name,
            object_id: None,
            created_at: None,
            updated_at: None,
            data: OrdMap::new(),
            complete: false,
            available_keys: OrdSet::new(),
        }
    }

    pub fn from_state(state: &EntityState) -> Self {
        Self {
            class_name: state.class_name.clone(),
            object_id: state.object_id.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            data: state.data.clone(),
            complete: state.complete,
            available_keys: state.available_keys.clone(),
            kind: state.kind.clone(),
        }
    }

    pub fn object_id(mut self, object_id: Option<String>) -> Self {
        self.object_id = object_id;
        self
    }

    pub fn created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    pub fn session_token(mut self, token: Option<String>) -> Self {
        if let EntityKind::Principal { session_token } = &mut self.kind {
            *session_token = token;
        }
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.available_keys.insert(key.clone());
        self.data.insert(key, value);
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.data.remove(key);
        self
    }

    /// Marks a key as selected even though the server returned no value.
    pub fn available(mut self, key: impl Into<String>) -> Self {
        self.available_keys.insert(key.into());
        self
    }

    /// Drops identity, timestamps and data; keeps the class.
    pub fn clear(mut self) -> Self {
        self.object_id = None;
        self.created_at = None;
        self.updated_at = None;
        self.data = OrdMap::new();
        self.complete = false;
        self.available_keys = OrdSet::new();
        self.kind = EntityKind::for_class(&self.class_name);
        self
    }

    /// Folds another (possibly partial) state in. Identity and timestamps
    /// are only overwritten when the incoming state has them.
    pub fn apply_state(mut self, other: &EntityState) -> Self {
        if other.object_id.is_some() {
            self.object_id = other.object_id.clone();
        }
        if other.created_at.is_some() {
            self.created_at = other.created_at;
        }
        if other.updated_at.is_some() {
            self.updated_at = other.updated_at;
        }
        self.complete |= other.complete;
        for (key, value) in other.data.iter() {
            self.data.insert(key.clone(), value.clone());
        }
        for key in other.available_keys.iter() {
            self.available_keys.insert(key.clone());
        }
        self.kind = self.kind.merged_with(&other.kind);
        self
    }

    /// Applies operations straight onto the confirmed data.
    pub fn apply_operations(mut self, operations: &OperationSet) -> Result<Self> {
        for (key, _) in operations.iter() {
            self.available_keys.insert(key.to_string());
        }
        operations.apply_to(&mut self.data)?;
        Ok(self)
    }

    pub fn build(mut self) -> EntityState {
        let updated_at = match (self.created_at, self.updated_at) {
            (Some(created), Some(updated)) => Some(updated.max(created)),
            (created, updated) => updated.or(created),
        };
        for key in self.data.keys() {
            self.available_keys.insert(key.clone());
        }
        EntityState {
            class_name: self.class_name,
            object_id: self.object_id,
            created_at: self.created_at,
            updated_at,
            data: self.data,
            complete: self.complete,
            available_keys: self.available_keys,
            kind: self.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::FieldOperation;
    use chrono::{Duration, TimeZone};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn sample() -> EntityState {
        EntityStateBuilder::new("Post")
            .object_id(Some("abc".into()))
            .created_at(Some(at(0)))
            .updated_at(Some(at(5)))
            .put("title", Value::from("hello"))
            .available("body")
            .complete(true)
            .build()
    }

    #[test]
    fn builder_round_trip_preserves_state() {
        let state = sample();
        assert_eq!(state.builder().build(), state);
    }

    #[test]
    fn partial_state_does_not_erase_identity() {
        let state = sample();
        let partial = EntityStateBuilder::new("Post")
            .put("title", Value::from("changed"))
            .build();
        let merged = state.builder().apply_state(&partial).build();

        assert_eq!(merged.object_id(), Some("abc"));
        assert_eq!(merged.created_at(), Some(at(0)));
        assert!(merged.is_complete());
        assert_eq!(merged.get("title"), Some(&Value::from("changed")));
    }

    #[test]
    fn completeness_is_ored() {
        let partial = EntityStateBuilder::new("Post").build();
        let merged = partial.builder().apply_state(&sample()).build();
        assert!(merged.is_complete());
    }

    #[test]
    fn updated_defaults_to_created_and_never_precedes_it() {
        let only_created = EntityStateBuilder::new("Post")
            .created_at(Some(at(10)))
            .build();
        assert_eq!(only_created.updated_at(), Some(at(10)));

        let skewed = EntityStateBuilder::new("Post")
            .created_at(Some(at(10)))
            .updated_at(Some(at(10) - Duration::seconds(3)))
            .build();
        assert_eq!(skewed.updated_at(), Some(at(10)));
    }

    #[test]
    fn available_keys_cover_data_keys() {
        let state = sample();
        for key in state.data().keys() {
            assert!(state.available_keys().contains(key));
        }
        assert!(state.available_keys().contains("body"));
    }

    #[test]
    fn apply_operations_folds_into_data() {
        let mut ops = OperationSet::new();
        ops.record("title", FieldOperation::Delete).unwrap();
        ops.record("views", FieldOperation::increment(2).unwrap())
            .unwrap();
        let state = sample().builder().apply_operations(&ops).unwrap().build();

        assert!(state.get("title").is_none());
        assert_eq!(state.get("views"), Some(&Value::Integer(2)));
        assert!(state.available_keys().contains("title"));
    }

    #[test]
    fn principal_kind_is_derived_from_class() {
        let user = EntityStateBuilder::new(PRINCIPAL_CLASS)
            .session_token(Some("r:token".into()))
            .build();
        assert!(user.kind().is_principal());
        assert_eq!(user.session_token(), Some("r:token"));

        let merged = user
            .builder()
            .apply_state(&EntityState::new(PRINCIPAL_CLASS))
            .build();
        assert_eq!(merged.session_token(), Some("r:token"));
    }
}
