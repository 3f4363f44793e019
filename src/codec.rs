//! JSON encoding of values, field operations and entity states, plus the
//! REST commands built from them.

use crate::core::{FileRef, Relation, Result, SyncError, Value, codes};
use crate::entity::Entity;
use crate::ops::{FieldOperation, OperationSet};
use crate::state::{EntityState, EntityStateBuilder, PRINCIPAL_CLASS};
use crate::transport::{Method, RestCommand};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;

/// How a reference to another entity is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEncoding {
    /// Only entities with a server id may be referenced.
    ObjectIdOnly,
    /// Entities without a server id are referenced by local id, to be
    /// resolved when the durable command is finally sent.
    AllowLocalId,
}

/// Writes pointers according to a [`PointerEncoding`] and remembers every
/// local id it emitted.
pub struct PointerEncoder {
    encoding: PointerEncoding,
    local_ids: Vec<String>,
}

impl PointerEncoder {
    pub fn new(encoding: PointerEncoding) -> Self {
        Self {
            encoding,
            local_ids: Vec::new(),
        }
    }

    pub fn encoding(&self) -> PointerEncoding {
        self.encoding
    }

    pub fn into_local_ids(self) -> Vec<String> {
        self.local_ids
    }

    pub fn encode(&mut self, entity: &Entity) -> Result<JsonValue> {
        let class_name = entity.class_name();
        if let Some(object_id) = entity.object_id() {
            return Ok(json!({ "__type": "Pointer", "className": class_name, "objectId": object_id }));
        }
        match self.encoding {
            PointerEncoding::ObjectIdOnly => Err(SyncError::server(
                codes::INVALID_POINTER,
                format!("Cannot reference an unsaved '{}'", class_name),
            )),
            PointerEncoding::AllowLocalId => {
                let local_id = entity.local_id();
                if !self.local_ids.contains(&local_id) {
                    self.local_ids.push(local_id.clone());
                }
                Ok(json!({ "__type": "Pointer", "className": class_name, "localId": local_id }))
            }
        }
    }
}

/// Produces entity handles for pointers found while decoding.
///
/// Passed explicitly so decoding never depends on ambient state.
pub trait EntityFactory {
    fn reference(&self, class_name: &str, object_id: &str) -> Entity;
}

pub trait EntityCodec: Send + Sync {
    fn encode_value(&self, value: &Value, pointers: &mut PointerEncoder) -> Result<JsonValue>;

    fn encode_operations(
        &self,
        operations: &OperationSet,
        pointers: &mut PointerEncoder,
    ) -> Result<JsonValue>;

    fn decode_value(&self, json: &JsonValue, factory: &dyn EntityFactory) -> Result<Value>;

    /// Decodes a server document into a state for `class_name`.
    ///
    /// `complete` marks the state as holding every field of the object
    /// rather than a partial result such as a save response.
    fn decode_state(
        &self,
        json: &JsonValue,
        class_name: &str,
        complete: bool,
        factory: &dyn EntityFactory,
    ) -> Result<EntityState>;
}

/// The store's document format: typed `__type` markers for references,
/// dates, files and relations, and `__op` markers for field operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

const RESERVED_FIELDS: [&str; 4] = ["objectId", "createdAt", "updatedAt", "sessionToken"];

impl EntityCodec for JsonCodec {
    fn encode_value(&self, value: &Value, pointers: &mut PointerEncoder) -> Result<JsonValue> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => json!(b),
            Value::Integer(i) => json!(i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| SyncError::InvalidValue(format!("Cannot encode number {}", f)))?,
            Value::Text(s) => json!(s),
            Value::Date(date) => json!({ "__type": "Date", "iso": format_date(date) }),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.encode_value(item, pointers))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => {
                let mut object = Map::new();
                for (key, item) in map {
                    object.insert(key.clone(), self.encode_value(item, pointers)?);
                }
                JsonValue::Object(object)
            }
            Value::Entity(entity) => pointers.encode(entity)?,
            Value::File(file) => encode_file(file)?,
            Value::Relation(relation) => {
                json!({ "__type": "Relation", "className": relation.target_class })
            }
        })
    }

    fn encode_operations(
        &self,
        operations: &OperationSet,
        pointers: &mut PointerEncoder,
    ) -> Result<JsonValue> {
        let mut body = Map::new();
        for (key, op) in operations.iter() {
            body.insert(key.to_string(), self.encode_operation(op, pointers)?);
        }
        Ok(JsonValue::Object(body))
    }

    fn decode_value(&self, json: &JsonValue, factory: &dyn EntityFactory) -> Result<Value> {
        Ok(match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.decode_value(item, factory))
                    .collect::<Result<_>>()?,
            ),
            JsonValue::Object(object) => match object.get("__type").and_then(|t| t.as_str()) {
                Some("Pointer") | Some("Object") => {
                    let class_name = required_str(object, "className")?;
                    let object_id = required_str(object, "objectId")?;
                    Value::Entity(factory.reference(class_name, object_id))
                }
                Some("Date") => Value::Date(parse_date(required_str(object, "iso")?)?),
                Some("File") => Value::File(FileRef::uploaded(
                    required_str(object, "name")?,
                    required_str(object, "url")?,
                )),
                Some("Relation") => Value::Relation(Relation::new(
                    object
                        .get("className")
                        .and_then(|c| c.as_str())
                        .map(str::to_string),
                )),
                _ => {
                    let mut map = BTreeMap::new();
                    for (key, item) in object {
                        map.insert(key.clone(), self.decode_value(item, factory)?);
                    }
                    Value::Map(map)
                }
            },
        })
    }

    fn decode_state(
        &self,
        json: &JsonValue,
        class_name: &str,
        complete: bool,
        factory: &dyn EntityFactory,
    ) -> Result<EntityState> {
        let object = json
            .as_object()
            .ok_or_else(|| SyncError::Codec(format!("'{}' document is not an object", class_name)))?;

        let mut builder = EntityStateBuilder::new(class_name).complete(complete);
        if let Some(object_id) = object.get("objectId").and_then(|v| v.as_str()) {
            builder = builder.object_id(Some(object_id.to_string()));
        }
        if let Some(created) = object.get("createdAt").and_then(|v| v.as_str()) {
            builder = builder.created_at(Some(parse_date(created)?));
        }
        if let Some(updated) = object.get("updatedAt").and_then(|v| v.as_str()) {
            builder = builder.updated_at(Some(parse_date(updated)?));
        }
        if let Some(token) = object.get("sessionToken").and_then(|v| v.as_str()) {
            builder = builder.session_token(Some(token.to_string()));
        }

        for (key, value) in object {
            if RESERVED_FIELDS.contains(&key.as_str()) || key == "className" || key == "__type" {
                continue;
            }
            builder = builder.put(key.clone(), self.decode_value(value, factory)?);
        }
        Ok(builder.build())
    }
}

impl JsonCodec {
    fn encode_list(&self, items: &[Value], pointers: &mut PointerEncoder) -> Result<JsonValue> {
        items
            .iter()
            .map(|item| self.encode_value(item, pointers))
            .collect::<Result<Vec<_>>>()
            .map(JsonValue::Array)
    }

    fn encode_operation(&self, op: &FieldOperation, pointers: &mut PointerEncoder) -> Result<JsonValue> {
        Ok(match op {
            FieldOperation::Set(value) => return self.encode_value(value, pointers),
            FieldOperation::Delete => json!({ "__op": "Delete" }),
            FieldOperation::Increment(amount) => {
                json!({ "__op": "Increment", "amount": self.encode_value(amount, pointers)? })
            }
            FieldOperation::Add(items) => {
                json!({ "__op": "Add", "objects": self.encode_list(items, pointers)? })
            }
            FieldOperation::AddUnique(items) => {
                json!({ "__op": "AddUnique", "objects": self.encode_list(items, pointers)? })
            }
            FieldOperation::Remove(items) => {
                json!({ "__op": "Remove", "objects": self.encode_list(items, pointers)? })
            }
            FieldOperation::Relation { add, remove, .. } => {
                let adds = json!({ "__op": "AddRelation", "objects": encode_pointers(add, pointers)? });
                let removes =
                    json!({ "__op": "RemoveRelation", "objects": encode_pointers(remove, pointers)? });
                match (add.is_empty(), remove.is_empty()) {
                    (false, false) => json!({ "__op": "Batch", "ops": [adds, removes] }),
                    (true, false) => removes,
                    _ => adds,
                }
            }
        })
    }
}

fn encode_pointers(entities: &[Entity], pointers: &mut PointerEncoder) -> Result<JsonValue> {
    entities
        .iter()
        .map(|entity| pointers.encode(entity))
        .collect::<Result<Vec<_>>>()
        .map(JsonValue::Array)
}

fn encode_file(file: &FileRef) -> Result<JsonValue> {
    let url = file.url().ok_or_else(|| {
        SyncError::InvalidValue(format!("File '{}' must be uploaded before it is referenced", file.name()))
    })?;
    Ok(json!({ "__type": "File", "name": file.name(), "url": url }))
}

fn required_str<'a>(object: &'a Map<String, JsonValue>, key: &str) -> Result<&'a str> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::Codec(format!("typed value is missing '{}'", key)))
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|err| SyncError::Codec(format!("invalid date '{}': {}", iso, err)))
}

fn class_path(class_name: &str) -> String {
    if class_name == PRINCIPAL_CLASS {
        "users".to_string()
    } else {
        format!("classes/{}", class_name)
    }
}

fn object_path(class_name: &str, object_id: &str) -> String {
    format!("{}/{}", class_path(class_name), object_id)
}

/// The command that sends one save generation.
///
/// Without a server id this is a create; under [`PointerEncoding::AllowLocalId`]
/// the command also carries the entity's local id so a delayed delivery can
/// turn it into an update if the entity was created meanwhile.
pub fn save_command(
    codec: &dyn EntityCodec,
    entity: &Entity,
    operations: &OperationSet,
    pointers: &mut PointerEncoder,
) -> Result<RestCommand> {
    let class_name = entity.class_name();
    let body = codec.encode_operations(operations, pointers)?;
    Ok(match entity.object_id() {
        Some(object_id) => {
            RestCommand::new(Method::Put, object_path(&class_name, &object_id)).with_body(body)
        }
        None => {
            let local_id = match pointers.encoding() {
                PointerEncoding::AllowLocalId => Some(entity.local_id()),
                PointerEncoding::ObjectIdOnly => None,
            };
            RestCommand::new(Method::Post, class_path(&class_name))
                .with_body(body)
                .with_local_id(local_id)
        }
    })
}

pub fn fetch_command(class_name: &str, object_id: &str) -> RestCommand {
    RestCommand::new(Method::Get, object_path(class_name, object_id))
}

/// Delete by server id, or by local id for a durable delete of an entity
/// whose create is still queued.
pub fn delete_command(entity: &Entity, encoding: PointerEncoding) -> Result<RestCommand> {
    let class_name = entity.class_name();
    match (entity.object_id(), encoding) {
        (Some(object_id), _) => Ok(RestCommand::new(Method::Delete, object_path(&class_name, &object_id))),
        (None, PointerEncoding::AllowLocalId) => Ok(RestCommand::new(Method::Delete, class_path(&class_name))
            .with_local_id(Some(entity.local_id()))),
        (None, PointerEncoding::ObjectIdOnly) => Err(SyncError::server(
            codes::MISSING_OBJECT_ID,
            format!("Cannot delete an unsaved '{}'", class_name),
        )),
    }
}
