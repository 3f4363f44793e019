use super::{Method, RestCommand, Transport};
use crate::core::{Result, SyncError, codes};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{Instrument, Level, debug_span, event};

/// Largest number of sub-requests the server accepts in one batch.
pub const MAX_BATCH_SIZE: usize = 50;
pub const BATCH_PATH: &str = "batch";

/// Packs independent commands into as few wire requests as possible and
/// routes each slot of the combined response back to its command.
#[derive(Clone)]
pub struct BatchMultiplexer {
    transport: Arc<dyn Transport>,
    max_batch_size: usize,
}

impl BatchMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, max_batch_size: usize) -> Self {
        Self {
            transport,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Sends every command and returns one result per command, in order.
    ///
    /// Chunks larger than the batch limit are sent one after another.
    pub async fn submit(&self, commands: Vec<RestCommand>) -> Vec<Result<JsonValue>> {
        let mut results = Vec::with_capacity(commands.len());
        for chunk in commands.chunks(self.max_batch_size) {
            results.extend(self.send_chunk(chunk).await);
        }
        results
    }

    async fn send_chunk(&self, chunk: &[RestCommand]) -> Vec<Result<JsonValue>> {
        match chunk {
            [] => Vec::new(),
            [single] => vec![self.transport.execute(single).await],
            many => {
                let span = debug_span!("sync.batch", size = many.len());
                self.send_batch(many).instrument(span).await
            }
        }
    }

    async fn send_batch(&self, commands: &[RestCommand]) -> Vec<Result<JsonValue>> {
        let requests: Vec<JsonValue> = commands.iter().map(RestCommand::batch_entry).collect();
        let batch = RestCommand::new(Method::Post, BATCH_PATH).with_body(json!({ "requests": requests }));

        let response = match self.transport.execute(&batch).await {
            Ok(response) => response,
            Err(err) => {
                event!(Level::DEBUG, error = %err, "batch request failed");
                return vec![Err(err); commands.len()];
            }
        };

        let Some(slots) = response.as_array() else {
            return inconsistent(commands.len(), "batch response is not an array".to_string());
        };
        if slots.len() != commands.len() {
            return inconsistent(
                commands.len(),
                format!(
                    "batch response has {} results for {} requests",
                    slots.len(),
                    commands.len()
                ),
            );
        }

        slots.iter().map(decode_slot).collect()
    }
}

fn inconsistent(count: usize, message: String) -> Vec<Result<JsonValue>> {
    event!(Level::ERROR, %message, "batch response rejected");
    vec![Err(SyncError::Inconsistent(message)); count]
}

fn decode_slot(slot: &JsonValue) -> Result<JsonValue> {
    if let Some(success) = slot.get("success") {
        return Ok(success.clone());
    }
    if let Some(error) = slot.get("error") {
        let code = error
            .get("code")
            .and_then(|c| c.as_i64())
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(codes::OTHER_CAUSE);
        let message = error
            .get("error")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        if code == codes::CONNECTION_FAILED {
            return Err(SyncError::Connection(message));
        }
        return Err(SyncError::server(code, message));
    }
    Err(SyncError::Inconsistent(
        "batch result has neither success nor error".to_string(),
    ))
}
