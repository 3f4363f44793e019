//! Stand-in identifiers for entities the server has not created yet.
//!
//! Durable commands may reference such an entity by local id. The registry
//! keeps a reference count per id so it can learn the server id once the
//! entity is created and hand it to every command still waiting on it.

use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{Level, event};
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalIdEntry {
    retain_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
}

pub struct LocalIdRegistry {
    dir: Option<PathBuf>,
    entries: Mutex<HashMap<String, LocalIdEntry>>,
}

impl LocalIdRegistry {
    /// A registry that forgets everything when the process exits.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A registry backed by one JSON file per id under `dir`.
    ///
    /// Files that cannot be parsed are removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            let Some(local_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !local_id.starts_with(LOCAL_ID_PREFIX) {
                continue;
            }
            let local_id = local_id.to_string();
            match fs::read(&path)
                .map_err(SyncError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<LocalIdEntry>(&bytes)?))
            {
                Ok(entry) => {
                    entries.insert(local_id, entry);
                }
                Err(err) => {
                    event!(Level::WARN, %local_id, error = %err, "discarding unreadable local id");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        event!(Level::DEBUG, dir = %dir.display(), count = entries.len(), "local id registry opened");
        Ok(Self {
            dir: Some(dir),
            entries: Mutex::new(entries),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LocalIdEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_local_id(&self) -> String {
        format!("{}{:016x}", LOCAL_ID_PREFIX, Uuid::new_v4().as_u64_pair().0)
    }

    /// Marks `local_id` as referenced by one more pending command.
    pub fn retain(&self, local_id: &str) -> Result<()> {
        let mut entries = self.entries();
        let entry = entries.entry(local_id.to_string()).or_default();
        entry.retain_count += 1;
        let snapshot = entry.clone();
        self.write_entry(local_id, Some(&snapshot))
    }

    /// Drops one reference; the entry is forgotten when none remain.
    pub fn release(&self, local_id: &str) -> Result<()> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(local_id) else {
            return Ok(());
        };
        entry.retain_count = entry.retain_count.saturating_sub(1);
        if entry.retain_count == 0 {
            entries.remove(local_id);
            return self.write_entry(local_id, None);
        }
        let snapshot = entry.clone();
        self.write_entry(local_id, Some(&snapshot))
    }

    /// Records the server id for a local id. Ignored when nothing retains
    /// the local id, since no pending command could need it.
    pub fn set_object_id(&self, local_id: &str, object_id: &str) -> Result<()> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(local_id) else {
            return Ok(());
        };
        if entry.object_id.as_deref() == Some(object_id) {
            return Ok(());
        }
        entry.object_id = Some(object_id.to_string());
        let snapshot = entry.clone();
        event!(Level::DEBUG, %local_id, %object_id, "local id resolved");
        self.write_entry(local_id, Some(&snapshot))
    }

    /// Retains every id in `local_ids`, writing entries on the blocking pool.
    pub async fn retain_all(self: &Arc<Self>, local_ids: &[String]) -> Result<()> {
        let local_ids = local_ids.to_vec();
        self.run_blocking(move |registry| {
            local_ids.iter().try_for_each(|local_id| registry.retain(local_id))
        })
        .await
    }

    /// Releases every id in `local_ids`. All ids are attempted; the first
    /// failure is returned.
    pub async fn release_all(self: &Arc<Self>, local_ids: &[String]) -> Result<()> {
        let local_ids = local_ids.to_vec();
        self.run_blocking(move |registry| {
            let mut first_error = None;
            for local_id in &local_ids {
                if let Err(err) = registry.release(local_id) {
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .await
    }

    /// [`LocalIdRegistry::set_object_id`] for callers on the async runtime.
    pub async fn resolve(self: &Arc<Self>, local_id: &str, object_id: &str) -> Result<()> {
        let (local_id, object_id) = (local_id.to_string(), object_id.to_string());
        self.run_blocking(move |registry| registry.set_object_id(&local_id, &object_id))
            .await
    }

    async fn run_blocking<T, F>(self: &Arc<Self>, work: F) -> Result<T>
    where
        F: FnOnce(&LocalIdRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.dir.is_none() {
            return work(&**self);
        }
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&registry))
            .await
            .map_err(|err| SyncError::Io(format!("local id write task failed: {}", err)))?
    }

    pub fn object_id_for(&self, local_id: &str) -> Option<String> {
        self.entries()
            .get(local_id)
            .and_then(|entry| entry.object_id.clone())
    }

    pub fn retain_count(&self, local_id: &str) -> u64 {
        self.entries()
            .get(local_id)
            .map(|entry| entry.retain_count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn write_entry(&self, local_id: &str, entry: Option<&LocalIdEntry>) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(local_id);
        match entry {
            None => match fs::remove_file(&path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            },
            Some(entry) => {
                let mut tmp = NamedTempFile::new_in(dir)?;
                tmp.write_all(&serde_json::to_vec(entry)?)?;
                tmp.as_file().sync_all()?;
                tmp.persist(&path).map_err(|err| SyncError::Io(err.to_string()))?;
                Ok(())
            }
        }
    }
}
