//! On-disk layout of the command cache: one file per queued command, named
//! so that a sorted directory listing is enqueue order.

use crate::core::Result;
use crate::transport::RestCommand;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;

pub const RECORD_PREFIX: &str = "CachedCommand_";
pub const RECORD_FORMAT: u32 = 1;
const TMP_SUFFIX: &str = ".tmp";

/// What is written to disk for one queued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub format: u32,
    pub command: RestCommand,
    /// Local id of the entity the command creates or targets, if it had no
    /// server id when queued.
    #[serde(default)]
    pub local_id: Option<String>,
    pub correlation: String,
    /// Local ids retained in the registry until this record is gone.
    #[serde(default)]
    pub retained_local_ids: Vec<String>,
}

impl CommandRecord {
    pub fn new(command: RestCommand, correlation: String) -> Self {
        Self {
            format: RECORD_FORMAT,
            local_id: command.local_id.clone(),
            retained_local_ids: command.referenced_local_ids(),
            command,
            correlation,
        }
    }

    /// Parses a record, refusing formats this version does not understand.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let record: CommandRecord = serde_json::from_slice(bytes).ok()?;
        (record.format == RECORD_FORMAT).then_some(record)
    }
}

/// A listed record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub name: String,
    pub size: u64,
}

/// `CachedCommand_` + 16 hex digits of milliseconds + `_` + 8 hex digits of
/// a counter that breaks ties within one millisecond.
pub fn record_file_name(timestamp_ms: u64, counter: u32) -> String {
    format!("{}{:016x}_{:08x}", RECORD_PREFIX, timestamp_ms, counter)
}

pub fn is_record_file_name(name: &str) -> bool {
    name.starts_with(RECORD_PREFIX) && !name.ends_with(TMP_SUFFIX)
}

pub struct CommandStore {
    dir: PathBuf,
    last_name: Mutex<(u64, u32)>,
}

impl CommandStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            last_name: Mutex::new((0, 0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A name strictly greater than any handed out before by this store,
    /// even if the clock moves backwards.
    pub fn next_name(&self) -> String {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_name.lock().unwrap_or_else(PoisonError::into_inner);
        *last = if now > last.0 {
            (now, 0)
        } else {
            (last.0, last.1.wrapping_add(1))
        };
        record_file_name(last.0, last.1)
    }

    /// Writes the record under `name` through a temporary file so a crash
    /// never leaves a partial record behind.
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}{}", name, TMP_SUFFIX));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.dir.join(name)).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Every record file, oldest first.
    pub async fn list(&self) -> Result<Vec<StoredRecord>> {
        list_records(&self.dir).await
    }
}

/// Lists the record files in `dir` in enqueue order.
pub async fn list_records(dir: &Path) -> Result<Vec<StoredRecord>> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_record_file_name(&name) {
            continue;
        }
        let size = entry.metadata().await?.len();
        records.push(StoredRecord { name, size });
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Method;
    use tempfile::tempdir;

    #[test]
    fn names_sort_in_creation_order() {
        assert_eq!(
            record_file_name(0x1a, 3),
            "CachedCommand_000000000000001a_00000003"
        );
        assert!(record_file_name(1, 0xffff_ffff) < record_file_name(2, 0));
        assert!(record_file_name(0x10, 0) > record_file_name(0xf, 0));
    }

    #[tokio::test]
    async fn names_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let store = CommandStore::open(dir.path()).await.unwrap();
        let names: Vec<String> = (0..100).map(|_| store.next_name()).collect();
        assert!(names.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn lists_records_in_name_order_and_skips_others() {
        let dir = tempdir().unwrap();
        let store = CommandStore::open(dir.path()).await.unwrap();
        store.write(&record_file_name(2, 0), b"b").await.unwrap();
        store.write(&record_file_name(1, 0), b"aa").await.unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").await.unwrap();
        fs::write(dir.path().join(format!("{}.tmp", record_file_name(3, 0))), b"x")
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(
            listed,
            vec![
                StoredRecord { name: record_file_name(1, 0), size: 2 },
                StoredRecord { name: record_file_name(2, 0), size: 1 },
            ]
        );
    }

    #[test]
    fn unknown_formats_are_refused() {
        let record = CommandRecord::new(RestCommand::new(Method::Get, "classes/A/1"), "c1".into());
        let bytes = serde_json::to_vec(&record).unwrap();
        assert_eq!(CommandRecord::parse(&bytes), Some(record));

        let mut old = serde_json::to_value(
            CommandRecord::new(RestCommand::new(Method::Get, "classes/A/1"), "c2".into()),
        )
        .unwrap();
        old["format"] = serde_json::json!(0);
        assert!(CommandRecord::parse(old.to_string().as_bytes()).is_none());
        assert!(CommandRecord::parse(b"garbage").is_none());
    }
}
