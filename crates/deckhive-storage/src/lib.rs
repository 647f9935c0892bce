//! Blob storage contract plus local-disk and in-memory backends.
//!
//! Keys are `/`-separated relative strings (`magic/mtgtop8/collections/1.json`).
//! Every tracker and replay path in the workspace talks to storage only through
//! [`BlobStore`], so a cloud backend can be slotted in without touching them.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "deckhive-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob {key} not found")]
    NotFound { key: String },
    #[error("invalid blob key {key:?}")]
    InvalidKey { key: String },
    #[error("{op} {key}: {source}")]
    Io {
        op: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(op: &'static str, key: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound { key: key.into() };
        }
        Self::Io {
            op,
            key: key.into(),
            source,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Replaces the whole blob at `key`.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Last modification time as reported by the backend, if it tracks one.
    async fn modified(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError>;
}

/// Joins key segments with `/`, ignoring stray separators at the seams.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn is_temp_file(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(".tmp")
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.key_path(key)?;
        fs::read(&path)
            .await
            .map_err(|err| StorageError::io("reading", key, err))
    }

    /// Writes through a temp file in the target directory and renames it into place,
    /// so readers never observe a half-written blob.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::io("creating directory for", key, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StorageError::io("opening temp file for", key, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StorageError::io("writing temp file for", key, err))?;
        file.flush()
            .await
            .map_err(|err| StorageError::io("flushing temp file for", key, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io("renaming temp file into", key, err));
        }
        debug!(key, bytes = bytes.len(), "blob written");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.key_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| StorageError::io("checking", key, err))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Walk from the deepest directory the prefix fully names.
        let dir_key = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_key)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::io("listing", prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StorageError::io("listing", prefix, err))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StorageError::io("listing", prefix, err))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if Self::is_temp_file(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn modified(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| StorageError::io("stat", key, err))?;
        Ok(metadata.modified().ok().map(DateTime::<Utc>::from))
    }
}

#[derive(Debug, Clone)]
struct MemoryBlob {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, MemoryBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a blob with an explicit modification time.
    pub async fn insert_at(&self, key: &str, bytes: Vec<u8>, modified: DateTime<Utc>) {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), MemoryBlob { bytes, modified });
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        self.insert_at(key, bytes.to_vec(), Utc::now()).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .blobs
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn modified(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.blobs.read().await.get(key).map(|blob| blob.modified))
    }
}
