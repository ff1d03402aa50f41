//! Shared key-value store reachable by both producer and consumer.
//!
//! The store owns the latest merged snapshot. Writes replace a whole value
//! atomically and return a [`FlushHandle`]; a write is only durable (and
//! visible to readers in another process) once the handle resolves.

use crate::error::{Result, SyncError};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Key under which the latest merged snapshot is stored.
pub const SNAPSHOT_KEY: &str = "latest_snapshot";

/// Completion token for a store write.
#[derive(Debug)]
pub struct FlushHandle {
    inner: FlushInner,
}

#[derive(Debug)]
enum FlushInner {
    Ready,
    Pending(oneshot::Receiver<Result<()>>),
}

impl FlushHandle {
    /// Handle for a write that is already durable.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            inner: FlushInner::Ready,
        }
    }

    /// Handle resolved by the sender once the write completes.
    #[must_use]
    pub fn pending() -> (Self, oneshot::Sender<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: FlushInner::Pending(rx),
            },
            tx,
        )
    }

    /// Wait until the write is confirmed complete.
    ///
    /// # Errors
    ///
    /// Returns the write's own error, or [`SyncError::StoreUnavailable`] if
    /// the writer went away without reporting.
    pub async fn wait(self) -> Result<()> {
        match self.inner {
            FlushInner::Ready => Ok(()),
            FlushInner::Pending(rx) => rx.await.map_err(|_| {
                SyncError::StoreUnavailable("writer dropped before flush completed".to_owned())
            })?,
        }
    }
}

/// Key-value blob store shared between the two sides.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the whole value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Replace the whole value under `key`. The write may still be in flight
    /// when this returns; see [`SharedStore::await_flush`].
    async fn set(&self, key: &str, value: Bytes) -> Result<FlushHandle>;

    /// Block until the write behind `handle` is durable.
    async fn await_flush(&self, handle: FlushHandle) -> Result<()> {
        handle.wait().await
    }
}

/// Read and decode the latest merged snapshot.
///
/// A stored value that no longer decodes is treated as absent so that the
/// next valid merge can replace it.
///
/// # Errors
///
/// Returns [`SyncError::StoreUnavailable`] when the store cannot be read.
pub async fn load_snapshot(store: &dyn SharedStore) -> Result<Option<Snapshot>> {
    let Some(bytes) = store.get(SNAPSHOT_KEY).await? else {
        return Ok(None);
    };
    match Snapshot::decode(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!("stored snapshot is unreadable, treating as absent: {e}");
            Ok(None)
        }
    }
}

/// In-process store.
///
/// Optionally delays write visibility to model a backing store whose writes
/// are enqueued before they become durable.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Bytes>>>,
    unavailable: Arc<AtomicBool>,
    flush_delay: Option<Duration>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes become visible only after `delay`, when the flush handle resolves.
    #[must_use]
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = Some(delay);
        self
    }

    /// Make every read and write fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Synchronous read of the currently visible value.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable(
                "memory store marked unavailable".to_owned(),
            ));
        }
        Ok(())
    }

    fn insert(values: &Mutex<HashMap<String, Bytes>>, key: String, value: Bytes) -> Result<()> {
        let mut map = values
            .lock()
            .map_err(|_| SyncError::StoreUnavailable("memory store lock poisoned".to_owned()))?;
        map.insert(key, value);
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        let map = self
            .values
            .lock()
            .map_err(|_| SyncError::StoreUnavailable("memory store lock poisoned".to_owned()))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<FlushHandle> {
        self.check_available()?;
        let Some(delay) = self.flush_delay else {
            Self::insert(&self.values, key.to_owned(), value)?;
            return Ok(FlushHandle::ready());
        };

        let (handle, done) = FlushHandle::pending();
        let values = Arc::clone(&self.values);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = done.send(Self::insert(&values, key, value));
        });
        Ok(handle)
    }
}

/// File-backed store: one file per key inside a directory.
///
/// Each write goes to a temporary file, is synced, then renamed over the
/// target, so readers see either the old or the new value in full.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(SyncError::StoreUnavailable(format!("invalid store key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

async fn write_atomically(path: PathBuf, value: Bytes) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&value).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[async_trait]
impl SharedStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<FlushHandle> {
        let path = self.path_for(key)?;
        let (handle, done) = FlushHandle::pending();
        tokio::spawn(async move {
            let result = write_atomically(path.clone(), value).await.map_err(|e| {
                SyncError::StoreUnavailable(format!("cannot write {}: {e}", path.display()))
            });
            if result.is_ok() {
                debug!("flushed {}", path.display());
            }
            let _ = done.send(result);
        });
        Ok(handle)
    }
}
