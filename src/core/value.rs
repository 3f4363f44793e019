use crate::core::{FileRef, Result, SyncError};
use crate::entity::Entity;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Every kind of value an entity field can hold.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Entity(Entity),
    File(FileRef),
    Relation(Relation),
}

/// A many-to-many link to other entities of one class.
///
/// Only the entities added through this handle are known locally; the full
/// membership lives on the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    pub target_class: Option<String>,
    pub known: Vec<Entity>,
}

impl Relation {
    pub fn new(target_class: Option<String>) -> Self {
        Self {
            target_class,
            known: Vec::new(),
        }
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.known.iter().any(|known| known.same_identity(entity))
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Entity(_) => "entity",
            Self::File(_) => "file",
            Self::Relation(_) => "relation",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRef> {
        match self {
            Self::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&Relation> {
        match self {
            Self::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }

    /// Adds two numbers. Integer + Integer stays an integer unless it overflows.
    pub fn add_numbers(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Ok(a
                .checked_add(*b)
                .map(Value::Integer)
                .unwrap_or_else(|| Value::Float(*a as f64 + *b as f64))),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                // both are numeric, as_f64 cannot fail here
                Ok(Value::Float(
                    a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default(),
                ))
            }
            _ => Err(SyncError::InvalidValue(format!(
                "Cannot add {} to {}",
                other.type_name(),
                self.type_name()
            ))),
        }
    }

    /// Rejects values that cannot be stored in a field.
    pub fn validate_storable(&self) -> Result<()> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(SyncError::InvalidValue(format!(
                "Non-finite number {} cannot be stored",
                f
            ))),
            Self::Relation(_) => Err(SyncError::InvalidValue(
                "Relations can only be changed with relation operations".to_string(),
            )),
            Self::List(items) => items.iter().try_for_each(Value::validate_storable),
            Self::Map(map) => {
                for (key, value) in map {
                    if key.is_empty() {
                        return Err(SyncError::InvalidKey(key.clone()));
                    }
                    value.validate_storable()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64) == *f
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a.same_identity(b),
            (Self::File(a), Self::File(b)) => a.same_file(b),
            (Self::Relation(a), Self::Relation(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Integer(i) => write!(f, "Integer({})", i),
            Self::Float(x) => write!(f, "Float({})", x),
            Self::Text(s) => write!(f, "Text({:?})", s),
            Self::Date(d) => write!(f, "Date({})", d.to_rfc3339()),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Entity(entity) => write!(f, "{:?}", entity),
            Self::File(file) => write!(f, "{:?}", file),
            Self::Relation(relation) => write!(f, "{:?}", relation),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Self::Entity(value)
    }
}

impl From<&Entity> for Value {
    fn from(value: &Entity) -> Self {
        Self::Entity(value.clone())
    }
}

impl From<FileRef> for Value {
    fn from(value: FileRef) -> Self {
        Self::File(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Map(value)
    }
}
