use super::{CacheEvent, CacheShared, CommandRecord};
use crate::core::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

pub(crate) struct CacheWorker {
    stop_tx: Option<watch::Sender<bool>>,
    join_handle: Option<JoinHandle<()>>,
}

impl CacheWorker {
    /// Signals the worker and waits for it to exit. A delivery already on
    /// the wire is settled first.
    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SyncError::Inconsistent(format!("cache worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub(crate) fn spawn_cache_worker(shared: Arc<CacheShared>) -> CacheWorker {
    let (stop_tx, stop_rx) = watch::channel(false);
    let join_handle = tokio::spawn(run(shared, stop_rx));
    CacheWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

enum Sweep {
    Drained,
    Disconnected,
    Stopped,
}

enum Delivery {
    Settled,
    Disconnected,
    Stopped,
}

async fn run(shared: Arc<CacheShared>, mut stop_rx: watch::Receiver<bool>) {
    event!(Level::DEBUG, "command cache worker started");
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let connected = shared.state.lock().await.connected;
        if connected {
            match sweep(&shared, &mut stop_rx).await {
                Sweep::Stopped => break,
                Sweep::Disconnected => continue,
                Sweep::Drained => {}
            }
        }
        tokio::select! {
            _ = shared.work.notified() => {}
            _ = shared.connectivity.notified() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    event!(Level::DEBUG, "command cache worker stopped");
}

/// Attempts every record on disk, oldest first. A record that keeps
/// failing to connect halts the sweep rather than letting later records
/// overtake it.
async fn sweep(shared: &CacheShared, stop_rx: &mut watch::Receiver<bool>) -> Sweep {
    let span = info_span!("sync.cache.sweep");
    async move {
        let listed = {
            let _state = shared.state.lock().await;
            shared.store.list().await
        };
        let records = match listed {
            Ok(records) => records,
            Err(err) => {
                event!(Level::ERROR, error = %err, "cannot list queued commands");
                return Sweep::Drained;
            }
        };

        for stored in records {
            if *stop_rx.borrow() {
                return Sweep::Stopped;
            }
            match deliver(shared, &stored.name, stop_rx).await {
                Delivery::Settled => {}
                Delivery::Disconnected => return Sweep::Disconnected,
                Delivery::Stopped => return Sweep::Stopped,
            }
        }
        Sweep::Drained
    }
    .instrument(span)
    .await
}

async fn deliver(shared: &CacheShared, name: &str, stop_rx: &mut watch::Receiver<bool>) -> Delivery {
    let bytes = {
        let mut state = shared.state.lock().await;
        if !state.connected {
            return Delivery::Disconnected;
        }
        match shared.store.read(name).await {
            Ok(Some(bytes)) => {
                state.in_flight = Some(name.to_string());
                bytes
            }
            // evicted or cleared since the listing
            Ok(None) => return Delivery::Settled,
            Err(err) => {
                event!(Level::ERROR, record = name, error = %err, "cannot read queued command");
                return Delivery::Settled;
            }
        }
    };

    let Some(record) = CommandRecord::parse(&bytes) else {
        let mut state = shared.state.lock().await;
        if let Err(err) = shared.store.remove(name).await {
            event!(Level::ERROR, record = name, error = %err, "cannot delete unreadable record");
        }
        state.in_flight = None;
        event!(Level::WARN, record = name, "discarding record in an unknown format");
        shared.emit(CacheEvent::Discarded {
            name: name.to_string(),
        });
        return Delivery::Settled;
    };

    let mut command = record.command.clone();
    if let Err(err) = command.resolve_local_ids(&shared.local_ids) {
        shared.finish(name, &record, Err(err)).await;
        return Delivery::Settled;
    }

    let mut attempts = 0u32;
    loop {
        match shared.transport.execute(&command).await {
            Ok(response) => {
                shared.finish(name, &record, Ok(response)).await;
                return Delivery::Settled;
            }
            Err(err) if err.is_connection() => {
                attempts += 1;
                event!(
                    Level::DEBUG,
                    record = name,
                    attempts,
                    error = %err,
                    "queued command could not reach the server"
                );
                if attempts >= shared.policy.max_retries {
                    let mut state = shared.state.lock().await;
                    state.connected = false;
                    state.in_flight = None;
                    event!(Level::INFO, record = name, attempts, "command cache going offline");
                    shared.emit(CacheEvent::Disconnected);
                    return Delivery::Disconnected;
                }

                tokio::select! {
                    _ = sleep(shared.policy.retry_cooldown()) => {}
                    _ = shared.connectivity.notified() => {}
                    _ = stop_rx.changed() => {}
                }

                let mut state = shared.state.lock().await;
                if *stop_rx.borrow() {
                    state.in_flight = None;
                    return Delivery::Stopped;
                }
                if !state.connected {
                    state.in_flight = None;
                    return Delivery::Disconnected;
                }
            }
            Err(err) => {
                shared.finish(name, &record, Err(err)).await;
                return Delivery::Settled;
            }
        }
    }
}
