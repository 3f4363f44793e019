use crate::core::{Result, SyncError};
use crate::transport::MAX_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the command cache does when a new record would exceed its budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Reject the new record and keep everything already queued.
    RejectNew,
    /// Delete the oldest queued records until the new one fits.
    #[default]
    EvictOldest,
}

/// Retry and storage limits for durable commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandCachePolicy {
    /// Connection failures tolerated per command before the cache
    /// considers itself offline.
    pub max_retries: u32,
    /// Pause between attempts after a connection failure, in milliseconds.
    pub retry_cooldown_ms: u64,
    /// Total bytes all queued records may occupy on disk.
    pub max_storage_bytes: u64,
    pub eviction: EvictionPolicy,
}

impl Default for CommandCachePolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_cooldown_ms: 600_000,
            max_storage_bytes: 10 * 1024 * 1024,
            eviction: EvictionPolicy::EvictOldest,
        }
    }
}

impl CommandCachePolicy {
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory for queued commands and local ids. `None` keeps
    /// everything in memory and disables durable commands across restarts.
    pub cache_dir: Option<PathBuf>,
    pub command_cache: CommandCachePolicy,
    pub batch: BatchPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            command_cache: CommandCachePolicy::default(),
            batch: BatchPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Io(format!("cannot read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&json)
    }

    /// Set the cache directory
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set the retry limit before the cache goes offline
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.command_cache.max_retries = retries;
        self
    }

    /// Set the cooldown between retries
    pub fn retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.command_cache.retry_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Set the on-disk budget for queued commands
    pub fn max_storage_bytes(mut self, bytes: u64) -> Self {
        self.command_cache.max_storage_bytes = bytes;
        self
    }

    pub fn eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.command_cache.eviction = eviction;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.batch.max_batch_size = size;
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.batch.max_batch_size = self.batch.max_batch_size.max(1);
        self.command_cache.max_retries = self.command_cache.max_retries.max(1);
        self
    }

    pub fn commands_dir(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("commands"))
    }

    pub fn local_ids_dir(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("local_ids"))
    }
}
