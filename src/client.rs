//! Client facade: owns the collaborators every entity shares and exposes the
//! bulk operations.

use crate::cache::CommandCache;
use crate::codec::{EntityCodec, EntityFactory, JsonCodec};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::core::{FileRef, Result, SyncError, Value};
use crate::deep_save::{deep_save, delete_wave};
use crate::entity::Entity;
use crate::local_id::LocalIdRegistry;
use crate::mirror::LocalMirror;
use crate::transport::{BatchMultiplexer, Transport};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// State shared by a client and every entity it hands out.
pub struct ClientCore {
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) batcher: BatchMultiplexer,
    pub(crate) codec: Arc<dyn EntityCodec>,
    pub(crate) local_ids: Arc<LocalIdRegistry>,
    pub(crate) cache: Arc<CommandCache>,
    pub(crate) mirror: Option<Arc<dyn LocalMirror>>,
    pub(crate) connectivity: ConnectivityMonitor,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Backing directory for the command cache when none was configured.
    _scratch: Option<TempDir>,
}

impl ClientCore {
    pub(crate) fn factory(self: &Arc<Self>) -> ClientFactory {
        ClientFactory { core: self.clone() }
    }

    fn stop_forwarder(&self) {
        let handle = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

/// Builds entity references for decoded pointers.
#[derive(Clone)]
pub struct ClientFactory {
    core: Arc<ClientCore>,
}

impl EntityFactory for ClientFactory {
    fn reference(&self, class_name: &str, object_id: &str) -> Entity {
        Entity::reference(self.core.clone(), class_name, object_id)
    }
}

/// Entry point of the library.
///
/// # Examples
///
/// ```
/// use memosync::{InMemoryTransport, SyncClient, SyncConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(InMemoryTransport::new());
/// let client = SyncClient::open(SyncConfig::default(), transport).await?;
///
/// let score = client.create("GameScore");
/// score.put("player", "Sean")?;
/// score.increment("points", 10)?;
/// score.save().await?;
/// assert!(score.object_id().is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SyncClient {
    core: Arc<ClientCore>,
}

impl SyncClient {
    /// Opens a client without a local mirror.
    ///
    /// With a `cache_dir`, queued commands and local ids survive restarts.
    /// Without one, the command cache lives in a temporary directory removed
    /// with the client.
    pub async fn open(config: SyncConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::open_inner(config, transport, None).await
    }

    pub async fn open_with_mirror(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        mirror: Arc<dyn LocalMirror>,
    ) -> Result<Self> {
        Self::open_inner(config, transport, Some(mirror)).await
    }

    async fn open_inner(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        mirror: Option<Arc<dyn LocalMirror>>,
    ) -> Result<Self> {
        let config = config.normalized();

        let (commands_dir, local_ids, scratch) = match (config.commands_dir(), config.local_ids_dir()) {
            (Some(commands_dir), Some(local_ids_dir)) => {
                let local_ids = tokio::task::spawn_blocking(move || LocalIdRegistry::open(local_ids_dir))
                    .await
                    .map_err(|err| SyncError::Inconsistent(format!("local id registry: {}", err)))??;
                (commands_dir, local_ids, None)
            }
            _ => {
                let scratch = TempDir::new()?;
                (scratch.path().join("commands"), LocalIdRegistry::in_memory(), Some(scratch))
            }
        };
        let local_ids = Arc::new(local_ids);

        let connectivity = ConnectivityMonitor::default();
        let cache = Arc::new(
            CommandCache::open(
                commands_dir,
                config.command_cache.clone(),
                transport.clone(),
                local_ids.clone(),
                connectivity.is_connected(),
            )
            .await?,
        );

        let mut transitions = connectivity.subscribe();
        let forwarded = cache.clone();
        let forwarder = tokio::spawn(async move {
            while transitions.changed().await.is_ok() {
                let connected = *transitions.borrow_and_update();
                forwarded.set_connected(connected).await;
            }
        });

        event!(
            Level::INFO,
            durable = scratch.is_none(),
            mirror = mirror.is_some(),
            "sync client opened"
        );

        let core = Arc::new(ClientCore {
            batcher: BatchMultiplexer::new(transport.clone(), config.batch.max_batch_size),
            config,
            transport,
            codec: Arc::new(JsonCodec),
            local_ids,
            cache,
            mirror,
            connectivity,
            forwarder: Mutex::new(Some(forwarder)),
            _scratch: scratch,
        });
        Ok(Self { core })
    }

    /// A new entity with no server id yet.
    pub fn create(&self, class_name: &str) -> Entity {
        Entity::new(self.core.clone(), class_name)
    }

    /// A placeholder for an existing server object. No data is available
    /// until it is fetched.
    pub fn reference(&self, class_name: &str, object_id: &str) -> Entity {
        Entity::reference(self.core.clone(), class_name, object_id)
    }

    pub fn create_file(&self, name: &str, bytes: Vec<u8>, content_type: Option<String>) -> FileRef {
        FileRef::new(name, bytes, content_type)
    }

    pub fn factory(&self) -> ClientFactory {
        self.core.factory()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// Saves every entity and whatever dirty data they reach, batching
    /// records that can be written together.
    pub async fn save_all(&self, entities: &[Entity]) -> Result<()> {
        let root = Value::List(entities.iter().cloned().map(Value::Entity).collect());
        deep_save(self.core.clone(), root).await
    }

    /// Deletes every entity in one batched request. Handles to the same
    /// object are deleted once.
    pub async fn delete_all(&self, entities: &[Entity]) -> Result<()> {
        let mut unique: Vec<Entity> = Vec::with_capacity(entities.len());
        for entity in entities {
            if !unique.iter().any(|known| known.same_identity(entity)) {
                unique.push(entity.clone());
            }
        }
        delete_wave(self.core.clone(), unique).await
    }

    /// Fetches every entity concurrently; fails with the first error after
    /// all of them have finished.
    pub async fn fetch_all(&self, entities: &[Entity]) -> Result<()> {
        let results = join_all(entities.iter().map(|entity| entity.fetch())).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub fn command_cache(&self) -> &CommandCache {
        &self.core.cache
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.core.connectivity
    }

    pub fn local_ids(&self) -> &LocalIdRegistry {
        &self.core.local_ids
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.core.transport
    }

    /// Stops delivering queued commands. Records stay on disk for the next
    /// client opened on the same directory.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.stop_forwarder();
        self.core.cache.pause().await?;
        event!(Level::INFO, "sync client shut down");
        Ok(())
    }
}
