//! Durable "run later" command queue.
//!
//! Every queued command is written to its own file before `enqueue`
//! returns. A single background worker replays the files in order whenever
//! the cache believes it is connected, retrying connection failures and
//! dropping commands the server rejects.
//!
//! Two locks: `state` guards the directory, the in-process waiters and the
//! connectivity flag; `worker` guards only whether the worker runs, so
//! stopping the worker never waits on a lock the worker itself needs.

mod store;
mod worker;

pub use store::{
    CommandRecord, CommandStore, RECORD_FORMAT, RECORD_PREFIX, StoredRecord, is_record_file_name,
    list_records, record_file_name,
};

use crate::config::{CommandCachePolicy, EvictionPolicy};
use crate::core::{Result, SyncError};
use crate::local_id::LocalIdRegistry;
use crate::transport::{RestCommand, Transport};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tracing::{Level, event};
use uuid::Uuid;
use worker::{CacheWorker, spawn_cache_worker};

/// Resolves with the server's answer to a queued command, as long as this
/// process is still running when it is delivered.
///
/// Resolves with [`SyncError::CacheFull`] if the record is evicted and with
/// [`SyncError::Cancelled`] if the cache is cleared or dropped first.
pub struct PendingDelivery<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingDelivery<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for PendingDelivery<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SyncError::Cancelled)))
    }
}

/// Diagnostic events; also what tests observe for commands nobody awaits.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Enqueued { name: String },
    Rejected { reason: String },
    Evicted { name: String },
    Delivered { name: String },
    Dropped { name: String, error: SyncError },
    /// A record written by an incompatible version was deleted unread.
    Discarded { name: String },
    Disconnected,
}

struct CacheState {
    connected: bool,
    pending: HashMap<String, oneshot::Sender<Result<JsonValue>>>,
    /// Record the worker is delivering; never evicted or cleared.
    in_flight: Option<String>,
}

pub(crate) struct CacheShared {
    store: CommandStore,
    policy: CommandCachePolicy,
    transport: Arc<dyn Transport>,
    local_ids: Arc<LocalIdRegistry>,
    state: Mutex<CacheState>,
    work: Notify,
    connectivity: Notify,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheShared {
    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    async fn release_local_ids(&self, record: &CommandRecord) {
        if let Err(err) = self.local_ids.release_all(&record.retained_local_ids).await {
            event!(Level::WARN, error = %err, "failed to release local ids");
        }
    }

    /// Deletes a record that will never be delivered and fails its waiter.
    async fn abandon(&self, state: &mut CacheState, name: &str, error: SyncError) -> Result<()> {
        if let Some(record) = self.store.read(name).await?.as_deref().and_then(CommandRecord::parse) {
            self.release_local_ids(&record).await;
            if let Some(tx) = state.pending.remove(&record.correlation) {
                let _ = tx.send(Err(error));
            }
        }
        self.store.remove(name).await
    }

    /// Settles a record after delivery or a permanent failure: learn the
    /// server id, delete the file, then answer the waiter.
    async fn finish(&self, name: &str, record: &CommandRecord, outcome: Result<JsonValue>) {
        let mut state = self.state.lock().await;
        if let (Ok(response), Some(local_id)) = (&outcome, &record.local_id) {
            if let Some(object_id) = response.get("objectId").and_then(|v| v.as_str()) {
                if let Err(err) = self.local_ids.resolve(local_id, object_id).await {
                    event!(Level::WARN, %local_id, error = %err, "failed to record server id");
                }
            }
        }
        if let Err(err) = self.store.remove(name).await {
            event!(Level::ERROR, record = name, error = %err, "failed to delete settled record");
        }
        self.release_local_ids(record).await;
        state.in_flight = None;

        match &outcome {
            Ok(_) => {
                event!(Level::DEBUG, record = name, "queued command delivered");
                self.emit(CacheEvent::Delivered { name: name.to_string() });
            }
            Err(err) => {
                event!(Level::WARN, record = name, error = %err, "queued command dropped");
                self.emit(CacheEvent::Dropped {
                    name: name.to_string(),
                    error: err.clone(),
                });
            }
        }
        if let Some(tx) = state.pending.remove(&record.correlation) {
            let _ = tx.send(outcome);
        }
    }
}

pub struct CommandCache {
    shared: Arc<CacheShared>,
    worker: Mutex<Option<CacheWorker>>,
}

impl CommandCache {
    /// Opens the queue stored in `dir` and starts its worker. Records left
    /// by an earlier process are delivered like new ones.
    pub async fn open(
        dir: impl AsRef<Path>,
        policy: CommandCachePolicy,
        transport: Arc<dyn Transport>,
        local_ids: Arc<LocalIdRegistry>,
        connected: bool,
    ) -> Result<Self> {
        let store = CommandStore::open(dir).await?;
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(CacheShared {
            store,
            policy,
            transport,
            local_ids,
            state: Mutex::new(CacheState {
                connected,
                pending: HashMap::new(),
                in_flight: None,
            }),
            work: Notify::new(),
            connectivity: Notify::new(),
            events,
        });
        event!(
            Level::INFO,
            dir = %shared.store.dir().display(),
            connected,
            "command cache opened"
        );
        let worker = spawn_cache_worker(shared.clone());
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn dir(&self) -> &Path {
        self.shared.store.dir()
    }

    pub fn policy(&self) -> &CommandCachePolicy {
        &self.shared.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Writes `command` to disk and wakes the worker.
    ///
    /// A record larger than the whole storage budget is rejected with
    /// [`SyncError::CacheFull`]. Otherwise, when the budget would be
    /// exceeded, the eviction policy decides between rejecting this record
    /// and deleting the oldest queued ones.
    pub async fn enqueue(&self, command: RestCommand) -> Result<PendingDelivery<JsonValue>> {
        let shared = &self.shared;
        let record = CommandRecord::new(command, Uuid::new_v4().to_string());
        let bytes = serde_json::to_vec(&record)?;
        let size = bytes.len() as u64;
        let budget = shared.policy.max_storage_bytes;

        if size > budget {
            return Err(self.reject(format!(
                "record of {} bytes exceeds the {} byte budget",
                size, budget
            )));
        }

        let mut state = shared.state.lock().await;
        let stored = shared.store.list().await?;
        let mut used: u64 = stored.iter().map(|r| r.size).sum();
        if used + size > budget {
            if shared.policy.eviction == EvictionPolicy::RejectNew {
                return Err(self.reject(format!("{} of {} bytes in use", used, budget)));
            }
            for victim in &stored {
                if used + size <= budget {
                    break;
                }
                if state.in_flight.as_deref() == Some(victim.name.as_str()) {
                    continue;
                }
                shared
                    .abandon(&mut state, &victim.name, SyncError::CacheFull("evicted".to_string()))
                    .await?;
                used -= victim.size;
                event!(Level::WARN, record = %victim.name, "evicted queued command");
                shared.emit(CacheEvent::Evicted {
                    name: victim.name.clone(),
                });
            }
            if used + size > budget {
                return Err(self.reject(format!("{} of {} bytes in use", used, budget)));
            }
        }

        shared.local_ids.retain_all(&record.retained_local_ids).await?;
        let name = shared.store.next_name();
        if let Err(err) = shared.store.write(&name, &bytes).await {
            shared.release_local_ids(&record).await;
            return Err(err);
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(record.correlation.clone(), tx);
        drop(state);

        event!(Level::DEBUG, record = %name, size, "command queued");
        shared.emit(CacheEvent::Enqueued { name });
        shared.work.notify_one();
        Ok(PendingDelivery::new(rx))
    }

    fn reject(&self, reason: String) -> SyncError {
        event!(Level::WARN, %reason, "queued command rejected");
        self.shared.emit(CacheEvent::Rejected {
            reason: reason.clone(),
        });
        SyncError::CacheFull(reason)
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.connected
    }

    /// Tells the worker whether delivery is worth attempting.
    pub async fn set_connected(&self, connected: bool) {
        {
            let mut state = self.shared.state.lock().await;
            if state.connected != connected {
                event!(Level::INFO, connected, "command cache connectivity changed");
            }
            state.connected = connected;
        }
        self.shared.connectivity.notify_one();
    }

    /// Stops the worker and waits until it has exited.
    pub async fn pause(&self) -> Result<()> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await?;
        }
        Ok(())
    }

    pub async fn resume(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(spawn_cache_worker(self.shared.clone()));
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Number of commands still on disk.
    pub async fn pending_count(&self) -> Result<usize> {
        let _state = self.shared.state.lock().await;
        Ok(self.shared.store.list().await?.len())
    }

    /// Deletes every queued command not currently being delivered. Their
    /// waiters resolve with [`SyncError::Cancelled`].
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        let stored = self.shared.store.list().await?;
        let mut cleared = 0;
        for record in stored {
            if state.in_flight.as_deref() == Some(record.name.as_str()) {
                continue;
            }
            self.shared
                .abandon(&mut state, &record.name, SyncError::Cancelled)
                .await?;
            cleared += 1;
        }
        event!(Level::INFO, cleared, "command cache cleared");
        Ok(cleared)
    }
}
