use super::{BATCH_PATH, FileUpload, Method, RestCommand, Transport};
use crate::core::{Result, SyncError, codes};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// One wire request as seen by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub method: Method,
    pub path: String,
    /// Number of sub-requests for a batch, 1 otherwise.
    pub size: usize,
}

#[derive(Default)]
struct ServerState {
    classes: HashMap<String, HashMap<String, Map<String, JsonValue>>>,
    files: HashMap<String, Arc<Vec<u8>>>,
    offline: bool,
    latency: Duration,
    scripted_failures: VecDeque<SyncError>,
    requests: Vec<RequestRecord>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// An in-memory stand-in for the remote store.
///
/// Understands the class, principal, batch and file endpoints, applies field
/// operations server-side, and can simulate being offline, slow, or failing.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline every request fails with a connection error.
    pub fn set_online(&self, online: bool) {
        self.state().offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !self.state().offline
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// The next wire request fails with `error` instead of being handled.
    pub fn fail_next(&self, error: SyncError) {
        self.state().scripted_failures.push_back(error);
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Highest number of simultaneous in-flight requests seen for `path`.
    pub fn max_concurrent_requests(&self, path: &str) -> usize {
        self.state().max_in_flight.get(path).copied().unwrap_or(0)
    }

    pub fn object(&self, class_name: &str, object_id: &str) -> Option<Map<String, JsonValue>> {
        self.state()
            .classes
            .get(class_name)
            .and_then(|objects| objects.get(object_id))
            .cloned()
    }

    pub fn objects(&self, class_name: &str) -> Vec<Map<String, JsonValue>> {
        let mut objects: Vec<_> = self
            .state()
            .classes
            .get(class_name)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default();
        objects.sort_by(|a, b| {
            let key = |o: &Map<String, JsonValue>| {
                o.get("createdAt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            key(a).cmp(&key(b))
        });
        objects
    }

    /// Stores an object directly, bypassing the request log. Returns its id.
    pub fn seed(&self, class_name: &str, fields: JsonValue) -> String {
        let mut state = self.state();
        let object_id = new_object_id();
        let now = timestamp();
        let mut object = fields.as_object().cloned().unwrap_or_default();
        object.insert("objectId".into(), json!(object_id));
        object.insert("createdAt".into(), json!(now));
        object.insert("updatedAt".into(), json!(now));
        state
            .classes
            .entry(class_name.to_string())
            .or_default()
            .insert(object_id.clone(), object);
        object_id
    }

    fn admit(&self, command: &RestCommand) -> Result<(Duration, Vec<String>)> {
        let mut state = self.state();
        let size = if command.path == BATCH_PATH {
            batch_requests(command).map(|r| r.len()).unwrap_or(0)
        } else {
            1
        };
        state.requests.push(RequestRecord {
            method: command.method,
            path: command.path.clone(),
            size,
        });
        if state.offline {
            return Err(SyncError::Connection("server unreachable".to_string()));
        }
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let paths = if command.path == BATCH_PATH {
            batch_requests(command)
                .map(|requests| {
                    requests
                        .iter()
                        .filter_map(|r| r.get("path").and_then(|p| p.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            vec![command.path.clone()]
        };
        for path in &paths {
            let current = {
                let counter = state.in_flight.entry(path.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let max = state.max_in_flight.entry(path.clone()).or_insert(0);
            *max = (*max).max(current);
        }
        Ok((state.latency, paths))
    }

    fn handle(&self, command: &RestCommand, paths: &[String]) -> Result<JsonValue> {
        let mut state = self.state();
        for path in paths {
            if let Some(counter) = state.in_flight.get_mut(path) {
                *counter = counter.saturating_sub(1);
            }
        }

        if command.path == BATCH_PATH {
            let requests = batch_requests(command)
                .ok_or_else(|| SyncError::server(codes::INVALID_JSON, "batch without requests"))?
                .clone();
            let slots = requests
                .iter()
                .map(|entry| {
                    let outcome = RestCommand::from_batch_entry(entry)
                        .and_then(|sub| apply_command(&mut state, &sub));
                    match outcome {
                        Ok(result) => json!({ "success": result }),
                        Err(err) => json!({ "error": { "code": err.code(), "error": err.to_string() } }),
                    }
                })
                .collect();
            return Ok(JsonValue::Array(slots));
        }

        apply_command(&mut state, command)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn execute(&self, command: &RestCommand) -> Result<JsonValue> {
        let (latency, paths) = self.admit(command)?;
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.handle(command, &paths)
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<JsonValue> {
        let latency = {
            let mut state = self.state();
            state.requests.push(RequestRecord {
                method: Method::Post,
                path: format!("files/{}", upload.name),
                size: 1,
            });
            if state.offline {
                return Err(SyncError::Connection("server unreachable".to_string()));
            }
            if let Some(error) = state.scripted_failures.pop_front() {
                return Err(error);
            }
            state.latency
        };
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let stored_name = format!("{}-{}", Uuid::new_v4().simple(), upload.name);
        self.state().files.insert(stored_name.clone(), upload.bytes);
        Ok(json!({
            "name": stored_name,
            "url": format!("memory://files/{}", stored_name),
        }))
    }
}

fn batch_requests(command: &RestCommand) -> Option<&Vec<JsonValue>> {
    command.body.as_ref()?.get("requests")?.as_array()
}

fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn not_found(path: &str) -> SyncError {
    SyncError::server(codes::OBJECT_NOT_FOUND, format!("No object at '{}'", path))
}

fn apply_command(state: &mut ServerState, command: &RestCommand) -> Result<JsonValue> {
    let segments: Vec<&str> = command.path.trim_matches('/').split('/').collect();
    let (class_name, object_id) = match segments.as_slice() {
        ["users"] => ("_User", None),
        ["users", id] => ("_User", Some(*id)),
        ["classes", class] => (*class, None),
        ["classes", class, id] => (*class, Some(*id)),
        _ => {
            return Err(SyncError::server(
                codes::INVALID_CLASS_NAME,
                format!("Unknown endpoint '{}'", command.path),
            ));
        }
    };

    match (command.method, object_id) {
        (Method::Post, None) => {
            let body = body_object(command)?;
            let mut object = Map::new();
            apply_fields(&mut object, body)?;
            let object_id = new_object_id();
            let now = timestamp();
            object.insert("objectId".into(), json!(object_id));
            object.insert("createdAt".into(), json!(now));
            object.insert("updatedAt".into(), json!(now));
            let mut response = json!({ "objectId": object_id, "createdAt": now });
            if class_name == "_User" {
                let token = format!("r:{}", Uuid::new_v4().simple());
                object.insert("sessionToken".into(), json!(token));
                response["sessionToken"] = json!(token);
            }
            state
                .classes
                .entry(class_name.to_string())
                .or_default()
                .insert(object_id, object);
            Ok(response)
        }
        (Method::Put, Some(id)) => {
            let body = body_object(command)?;
            let object = state
                .classes
                .get_mut(class_name)
                .and_then(|objects| objects.get_mut(id))
                .ok_or_else(|| not_found(&command.path))?;
            apply_fields(object, body)?;
            let now = timestamp();
            object.insert("updatedAt".into(), json!(now));
            Ok(json!({ "updatedAt": now }))
        }
        (Method::Get, Some(id)) => state
            .classes
            .get(class_name)
            .and_then(|objects| objects.get(id))
            .map(|object| JsonValue::Object(object.clone()))
            .ok_or_else(|| not_found(&command.path)),
        (Method::Delete, Some(id)) => state
            .classes
            .get_mut(class_name)
            .and_then(|objects| objects.remove(id))
            .map(|_| json!({}))
            .ok_or_else(|| not_found(&command.path)),
        (method, _) => Err(SyncError::server(
            codes::MISSING_OBJECT_ID,
            format!("{} is not supported on '{}'", method, command.path),
        )),
    }
}

fn body_object(command: &RestCommand) -> Result<&Map<String, JsonValue>> {
    command
        .body
        .as_ref()
        .and_then(|b| b.as_object())
        .ok_or_else(|| SyncError::server(codes::INVALID_JSON, "request body must be an object"))
}

fn apply_fields(object: &mut Map<String, JsonValue>, body: &Map<String, JsonValue>) -> Result<()> {
    for (key, value) in body {
        if matches!(key.as_str(), "objectId" | "createdAt" | "updatedAt") {
            continue;
        }
        reject_local_pointers(value)?;
        match value.get("__op").and_then(|op| op.as_str()) {
            Some(op) => {
                let current = object.remove(key);
                if let Some(next) = apply_server_op(op, value, current, key)? {
                    object.insert(key.clone(), next);
                }
            }
            None => {
                object.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

fn reject_local_pointers(value: &JsonValue) -> Result<()> {
    match value {
        JsonValue::Object(map) => {
            if map.contains_key("localId") {
                return Err(SyncError::server(
                    codes::INVALID_POINTER,
                    "pointer to an object that does not exist yet",
                ));
            }
            map.values().try_for_each(reject_local_pointers)
        }
        JsonValue::Array(items) => items.iter().try_for_each(reject_local_pointers),
        _ => Ok(()),
    }
}

fn apply_server_op(
    op: &str,
    value: &JsonValue,
    current: Option<JsonValue>,
    key: &str,
) -> Result<Option<JsonValue>> {
    let objects = || {
        value
            .get("objects")
            .and_then(|o| o.as_array())
            .cloned()
            .unwrap_or_default()
    };
    let current_list = |current: Option<JsonValue>| -> Result<Vec<JsonValue>> {
        match current {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::Array(items)) => Ok(items),
            Some(_) => Err(SyncError::server(
                codes::INCORRECT_TYPE,
                format!("field '{}' is not an array", key),
            )),
        }
    };

    match op {
        "Delete" => Ok(None),
        "Increment" => {
            let amount = value.get("amount").cloned().unwrap_or(json!(0));
            let next = match (&current, current.as_ref().and_then(|c| c.as_i64()), amount.as_i64()) {
                (None | Some(JsonValue::Null), _, _) => amount,
                (_, Some(a), Some(b)) => json!(a.wrapping_add(b)),
                (Some(c), _, _) => {
                    let base = c.as_f64().ok_or_else(|| {
                        SyncError::server(
                            codes::INCORRECT_TYPE,
                            format!("field '{}' is not a number", key),
                        )
                    })?;
                    json!(base + amount.as_f64().unwrap_or(0.0))
                }
            };
            Ok(Some(next))
        }
        "Add" => {
            let mut items = current_list(current)?;
            items.extend(objects());
            Ok(Some(JsonValue::Array(items)))
        }
        "AddUnique" => {
            let mut items = current_list(current)?;
            for object in objects() {
                if !items.contains(&object) {
                    items.push(object);
                }
            }
            Ok(Some(JsonValue::Array(items)))
        }
        "Remove" => {
            let removed = objects();
            let mut items = current_list(current)?;
            items.retain(|item| !removed.contains(item));
            Ok(Some(JsonValue::Array(items)))
        }
        "AddRelation" | "RemoveRelation" | "Batch" => {
            let class_name = value
                .get("objects")
                .or_else(|| value.get("ops").and_then(|ops| ops.get(0)?.get("objects")))
                .and_then(|o| o.get(0))
                .and_then(|p| p.get("className"))
                .cloned()
                .unwrap_or(JsonValue::Null);
            Ok(Some(current.unwrap_or_else(
                || json!({ "__type": "Relation", "className": class_name }),
            )))
        }
        other => Err(SyncError::server(
            codes::INVALID_JSON,
            format!("unknown operation '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_update_fetch_delete_cycle() {
        let server = InMemoryTransport::new();
        let created = server
            .execute(&RestCommand::new(Method::Post, "classes/Post").with_body(json!({"n": 1})))
            .await
            .unwrap();
        let id = created["objectId"].as_str().unwrap().to_string();

        server
            .execute(
                &RestCommand::new(Method::Put, format!("classes/Post/{}", id))
                    .with_body(json!({"n": {"__op": "Increment", "amount": 2}})),
            )
            .await
            .unwrap();

        let fetched = server
            .execute(&RestCommand::new(Method::Get, format!("classes/Post/{}", id)))
            .await
            .unwrap();
        assert_eq!(fetched["n"], json!(3));

        server
            .execute(&RestCommand::new(Method::Delete, format!("classes/Post/{}", id)))
            .await
            .unwrap();
        assert!(server.object("Post", &id).is_none());
    }

    #[tokio::test]
    async fn offline_requests_fail_with_connection_errors() {
        let server = InMemoryTransport::new();
        server.set_online(false);
        let err = server
            .execute(&RestCommand::new(Method::Post, "classes/Post").with_body(json!({})))
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn batch_reports_per_request_outcomes() {
        let server = InMemoryTransport::new();
        let batch = RestCommand::new(Method::Post, BATCH_PATH).with_body(json!({
            "requests": [
                {"method": "POST", "path": "classes/Post", "body": {"a": 1}},
                {"method": "GET", "path": "classes/Post/missing"},
            ]
        }));
        let response = server.execute(&batch).await.unwrap();
        assert!(response[0].get("success").is_some());
        assert_eq!(response[1]["error"]["code"], json!(codes::OBJECT_NOT_FOUND));
        assert_eq!(server.requests()[0].size, 2);
    }
}
