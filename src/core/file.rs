use crate::core::{Result, SyncError};
use crate::task_queue::TaskQueue;
use crate::transport::{FileUpload, Transport};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Level, event};

/// A leaf attachment: binary content that must be uploaded before any entity
/// referencing it can be saved.
#[derive(Clone)]
pub struct FileRef {
    inner: Arc<FileInner>,
}

struct FileInner {
    data: Mutex<FileData>,
    queue: TaskQueue,
}

#[derive(Debug, Clone)]
struct FileData {
    name: String,
    url: Option<String>,
    content_type: Option<String>,
    pending_bytes: Option<Arc<Vec<u8>>>,
}

impl FileRef {
    /// A new, not yet uploaded file.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, content_type: Option<String>) -> Self {
        Self::from_data(FileData {
            name: name.into(),
            url: None,
            content_type,
            pending_bytes: Some(Arc::new(bytes)),
        })
    }

    /// A file that already lives on the server.
    pub fn uploaded(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_data(FileData {
            name: name.into(),
            url: Some(url.into()),
            content_type: None,
            pending_bytes: None,
        })
    }

    fn from_data(data: FileData) -> Self {
        Self {
            inner: Arc::new(FileInner {
                data: Mutex::new(data),
                queue: TaskQueue::new(),
            }),
        }
    }

    fn data(&self) -> MutexGuard<'_, FileData> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.data().name.clone()
    }

    pub fn url(&self) -> Option<String> {
        self.data().url.clone()
    }

    pub fn content_type(&self) -> Option<String> {
        self.data().content_type.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.data().url.is_none()
    }

    pub fn same_file(&self, other: &FileRef) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (a, b) = (self.data().clone(), other.data().clone());
        a.url.is_some() && a.url == b.url && a.name == b.name
    }

    /// Uploads the file unless it already has a url. Concurrent calls are
    /// serialized; the later one finds the url set and returns immediately.
    pub async fn save(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let file = self.clone();
        self.inner
            .queue
            .enqueue(move |prior| async move {
                prior.await;
                let upload = {
                    let data = file.data();
                    if data.url.is_some() {
                        return Ok(());
                    }
                    let bytes = data.pending_bytes.clone().ok_or_else(|| {
                        SyncError::InvalidValue(format!("File '{}' has no content", data.name))
                    })?;
                    FileUpload {
                        name: data.name.clone(),
                        content_type: data.content_type.clone(),
                        bytes,
                    }
                };

                let response = transport.upload_file(upload).await?;
                let url = response
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SyncError::Codec("file upload response has no url".into()))?
                    .to_string();
                let name = response.get("name").and_then(|v| v.as_str());

                let mut data = file.data();
                if let Some(name) = name {
                    data.name = name.to_string();
                }
                data.url = Some(url);
                data.pending_bytes = None;
                event!(Level::DEBUG, file = %data.name, "file uploaded");
                Ok(())
            })
            .await
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("FileRef")
            .field("name", &data.name)
            .field("url", &data.url)
            .finish()
    }
}
