//! Wire commands, the transport seam, request batching and an in-memory
//! server used by tests and demos.

mod batch;
mod in_memory;

pub use batch::{BATCH_PATH, BatchMultiplexer, MAX_BATCH_SIZE};
pub use in_memory::{InMemoryTransport, RequestRecord};

use crate::core::{Result, SyncError, codes};
use crate::local_id::LocalIdRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(label)
    }
}

/// One request against the remote store.
///
/// `local_id` is set when the command targets an entity the server has not
/// assigned an id to yet; [`RestCommand::resolve_local_ids`] rewrites it once
/// the id is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestCommand {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

impl RestCommand {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            local_id: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_local_id(mut self, local_id: Option<String>) -> Self {
        self.local_id = local_id;
        self
    }

    /// The sub-request form used inside a batch body.
    pub fn batch_entry(&self) -> serde_json::Value {
        let mut entry = serde_json::Map::new();
        entry.insert("method".into(), serde_json::Value::from(self.method.to_string()));
        entry.insert("path".into(), serde_json::Value::from(self.path.clone()));
        if let Some(body) = &self.body {
            entry.insert("body".into(), body.clone());
        }
        serde_json::Value::Object(entry)
    }

    /// Parses a batch sub-request back into a command.
    pub fn from_batch_entry(entry: &serde_json::Value) -> Result<Self> {
        let method = entry
            .get("method")
            .cloned()
            .ok_or_else(|| SyncError::Codec("batch entry without method".into()))?;
        let method: Method = serde_json::from_value(method)?;
        let path = entry
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| SyncError::Codec("batch entry without path".into()))?;
        let mut command = Self::new(method, path);
        command.body = entry.get("body").cloned();
        Ok(command)
    }

    /// Every local id the command mentions: its own target and any pointer in
    /// the body.
    pub fn referenced_local_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(local_id) = &self.local_id {
            ids.push(local_id.clone());
        }
        if let Some(body) = &self.body {
            collect_pointer_local_ids(body, &mut ids);
        }
        ids
    }

    /// Replaces local ids with server ids learned since the command was
    /// written. A create whose target has meanwhile been created becomes an
    /// update of that object.
    pub fn resolve_local_ids(&mut self, registry: &LocalIdRegistry) -> Result<()> {
        if let Some(local_id) = self.local_id.clone() {
            if let Some(object_id) = registry.object_id_for(&local_id) {
                self.local_id = None;
                self.path = format!("{}/{}", self.path.trim_end_matches('/'), object_id);
                if self.method == Method::Post {
                    self.method = Method::Put;
                }
            } else if self.method != Method::Post {
                return Err(SyncError::server(
                    codes::MISSING_OBJECT_ID,
                    format!("Target '{}' was never created", local_id),
                ));
            }
        }
        if let Some(body) = self.body.as_mut() {
            resolve_pointer_local_ids(body, registry)?;
        }
        Ok(())
    }
}

fn collect_pointer_local_ids(value: &serde_json::Value, ids: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("__type").and_then(|t| t.as_str()) == Some("Pointer") {
                if let Some(local_id) = map.get("localId").and_then(|l| l.as_str()) {
                    if !ids.iter().any(|id| id == local_id) {
                        ids.push(local_id.to_string());
                    }
                }
                return;
            }
            for child in map.values() {
                collect_pointer_local_ids(child, ids);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items {
                collect_pointer_local_ids(child, ids);
            }
        }
        _ => {}
    }
}

fn resolve_pointer_local_ids(
    value: &mut serde_json::Value,
    registry: &LocalIdRegistry,
) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("__type").and_then(|t| t.as_str()) == Some("Pointer") {
                let local_id = map
                    .get("localId")
                    .and_then(|l| l.as_str())
                    .map(str::to_string);
                if let Some(local_id) = local_id {
                    let object_id = registry.object_id_for(&local_id).ok_or_else(|| {
                        SyncError::server(
                            codes::INVALID_POINTER,
                            format!("Pointer to unsaved entity '{}'", local_id),
                        )
                    })?;
                    map.remove("localId");
                    map.insert("objectId".into(), serde_json::Value::from(object_id));
                }
                return Ok(());
            }
            for child in map.values_mut() {
                resolve_pointer_local_ids(child, registry)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for child in items {
                resolve_pointer_local_ids(child, registry)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Content handed to [`Transport::upload_file`].
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Arc<Vec<u8>>,
}

/// The authenticated connection to the remote store.
///
/// Implementations report transient reachability problems as
/// [`SyncError::Connection`]; every other error is treated as permanent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &RestCommand) -> Result<serde_json::Value>;

    /// Uploads a file; the response carries `name` and `url`.
    async fn upload_file(&self, upload: FileUpload) -> Result<serde_json::Value> {
        Err(SyncError::server(
            codes::OTHER_CAUSE,
            format!("Transport cannot upload file '{}'", upload.name),
        ))
    }
}
