//! On-disk data caching.
//!
//! [`DiskCache`] maps string keys to opaque byte blobs. Writes are
//! deferred: they land in an in-memory staging area and are flushed in
//! batches after a short delay (or on [`DataCaching::flush`]). Reads
//! consult the staging area first, so a read following a write always
//! observes it. Total size is bounded by an LRU sweep over file
//! modification times.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Contract of the on-disk data cache tier.
#[async_trait]
pub trait DataCaching: Send + Sync {
    /// Read the blob for `key`, if any.
    async fn cached_data(&self, key: &str) -> Option<Bytes>;
    /// Whether a blob exists for `key`.
    async fn contains_data(&self, key: &str) -> bool;
    /// Stage a write for `key`. Staged writes become durable on flush.
    fn store_data(&self, key: &str, data: Bytes);
    /// Stage a removal for `key`.
    fn remove_data(&self, key: &str);
    /// Remove every entry, staged or durable.
    fn remove_all(&self);
    /// Write all staged changes to disk now.
    async fn flush(&self);
}

struct Staging {
    // None marks a staged removal
    entries: HashMap<String, Option<Bytes>>,
    is_flush_scheduled: bool,
}

struct DiskInner {
    root: PathBuf,
    size_limit: u64,
    flush_delay: Duration,
    staging: Mutex<Staging>,
}

/// A size-bounded disk blob store with deferred writes.
///
/// # Examples
///
/// ```rust,no_run
/// use pixfetch::cache::{DataCaching, DiskCache};
/// use bytes::Bytes;
///
/// # async fn example() -> pixfetch::Result<()> {
/// let cache = DiskCache::new("/tmp/pixfetch-cache")?;
/// cache.store_data("http://test.com/a.png", Bytes::from_static(b"..."));
/// cache.flush().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<DiskInner>,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `root` with the
    /// default 150 MiB size bound.
    pub fn new(root: impl Into<PathBuf>) -> crate::Result<Self> {
        Self::with_size_limit(root, 150 * 1024 * 1024)
    }

    /// Open a cache with an explicit size bound in bytes.
    pub fn with_size_limit(root: impl Into<PathBuf>, size_limit: u64) -> crate::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(DiskInner {
                root,
                size_limit,
                flush_delay: Duration::from_secs(1),
                staging: Mutex::new(Staging {
                    entries: HashMap::new(),
                    is_flush_scheduled: false,
                }),
            }),
        })
    }

    /// Override the write-coalescing delay (mainly for tests).
    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("flush delay must be set before the cache is shared")
            .flush_delay = flush_delay;
        self
    }

    /// Filesystem path backing `key`. The file exists only after a
    /// flush.
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.inner.path_for_key(key)
    }

    /// Total size of the durable entries in bytes.
    pub async fn total_size(&self) -> u64 {
        let root = self.inner.root.clone();
        tokio::task::spawn_blocking(move || directory_size(&root))
            .await
            .unwrap_or(0)
    }
}

impl DiskInner {
    fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(format!("{:x}", md5::compute(key)))
    }

    fn schedule_flush(inner: &Arc<Self>, staging: &mut Staging) {
        if staging.is_flush_scheduled {
            return;
        }
        staging.is_flush_scheduled = true;
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.flush_delay).await;
            inner.flush_now().await;
        });
    }

    async fn flush_now(&self) {
        let entries = {
            let mut staging = self.staging.lock().unwrap();
            staging.is_flush_scheduled = false;
            std::mem::take(&mut staging.entries)
        };
        if entries.is_empty() {
            return;
        }
        for (key, change) in entries {
            let path = self.path_for_key(&key);
            match change {
                Some(data) => {
                    if let Err(err) = write_atomically(&path, &data).await {
                        log::warn!("disk cache: failed to write {}: {}", path.display(), err);
                    }
                }
                None => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        self.sweep_if_needed().await;
    }

    async fn sweep_if_needed(&self) {
        let root = self.root.clone();
        let size_limit = self.size_limit;
        let result = tokio::task::spawn_blocking(move || sweep(&root, size_limit)).await;
        if let Ok(Err(err)) = result {
            log::warn!("disk cache: sweep failed: {}", err);
        }
    }
}

async fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

fn directory_size(root: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

// Removes least-recently-modified files until the store is at 70% of
// its bound.
fn sweep(root: &Path, size_limit: u64) -> std::io::Result<()> {
    let mut files = Vec::new();
    let mut total: u64 = 0;
    for entry in std::fs::read_dir(root)?.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        total += metadata.len();
        files.push((
            entry.path(),
            metadata.len(),
            metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        ));
    }
    if total <= size_limit {
        return Ok(());
    }
    let target = size_limit / 10 * 7;
    files.sort_by_key(|(_, _, modified)| *modified);
    for (path, len, _) in files {
        if total <= target {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            total -= len;
        }
    }
    Ok(())
}

#[async_trait]
impl DataCaching for DiskCache {
    async fn cached_data(&self, key: &str) -> Option<Bytes> {
        {
            let staging = self.inner.staging.lock().unwrap();
            if let Some(change) = staging.entries.get(key) {
                return change.clone();
            }
        }
        let path = self.inner.path_for_key(key);
        tokio::fs::read(&path).await.ok().map(Bytes::from)
    }

    async fn contains_data(&self, key: &str) -> bool {
        {
            let staging = self.inner.staging.lock().unwrap();
            if let Some(change) = staging.entries.get(key) {
                return change.is_some();
            }
        }
        tokio::fs::try_exists(self.inner.path_for_key(key))
            .await
            .unwrap_or(false)
    }

    fn store_data(&self, key: &str, data: Bytes) {
        let mut staging = self.inner.staging.lock().unwrap();
        staging.entries.insert(key.to_string(), Some(data));
        DiskInner::schedule_flush(&self.inner, &mut staging);
    }

    fn remove_data(&self, key: &str) {
        let mut staging = self.inner.staging.lock().unwrap();
        staging.entries.insert(key.to_string(), None);
        DiskInner::schedule_flush(&self.inner, &mut staging);
    }

    fn remove_all(&self) {
        {
            let mut staging = self.inner.staging.lock().unwrap();
            staging.entries.clear();
        }
        if let Err(err) = std::fs::remove_dir_all(&self.inner.root)
            .and_then(|_| std::fs::create_dir_all(&self.inner.root))
        {
            log::warn!("disk cache: remove_all failed: {}", err);
        }
    }

    async fn flush(&self) {
        self.inner.flush_now().await;
    }
}
