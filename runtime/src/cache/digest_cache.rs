//! Persistent digest cache backed by a JSON file.
//!
//! All items live in `<dir>/digest-cache.json`. Every read and write holds an
//! exclusive advisory lock on `<dir>/digest-cache.lock`, so concurrent builds
//! in separate processes see a consistent file. Items older than the TTL are
//! ignored on read and dropped on the next write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use modpack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

const CACHE_FILE: &str = "digest-cache.json";
const LOCK_FILE: &str = "digest-cache.lock";
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Items older than this are treated as absent.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on waiting for the cache lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached digest of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItem {
    /// Absolute file path
    pub path: String,
    /// File modification time when the digest was computed
    pub mod_time: DateTime<Utc>,
    /// File size when the digest was computed
    pub size: u64,
    /// Content digest
    pub digest: String,
    /// When the item was written
    pub created_at: DateTime<Utc>,
}

impl CacheItem {
    /// Item for `path` as described by `meta`.
    pub fn new(path: &Path, meta: &std::fs::Metadata, digest: &str) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            mod_time: mod_time(meta),
            size: meta.len(),
            digest: digest.to_string(),
            created_at: Utc::now(),
        }
    }

    /// True when size and modification time match `meta` exactly.
    pub fn matches(&self, meta: &std::fs::Metadata) -> bool {
        self.size == meta.len() && self.mod_time == mod_time(meta)
    }
}

fn mod_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Digest cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct DigestCache {
    dir: PathBuf,
    ttl: Duration,
    lock_timeout: Duration,
}

impl DigestCache {
    /// Open (and create) a cache directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            PackError::CacheError(format!(
                "Failed to create digest cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            ttl: DEFAULT_TTL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up the item for `path`. Expired items are reported as absent.
    pub async fn get(&self, path: &Path) -> Result<Option<CacheItem>> {
        let cache = self.clone();
        let key = path.to_string_lossy().into_owned();
        run_blocking(move || {
            let _lock = cache.lock()?;
            let items = cache.load()?;
            Ok(items
                .into_iter()
                .find(|item| item.path == key)
                .filter(|item| !cache.is_expired(item)))
        })
        .await
    }

    /// Insert or replace an item, pruning expired items. A corrupt cache file
    /// is replaced by one holding just this item.
    pub async fn put(&self, item: CacheItem) -> Result<()> {
        let cache = self.clone();
        run_blocking(move || {
            let _lock = cache.lock()?;
            let mut items = cache.load_for_update()?;
            items.retain(|existing| existing.path != item.path && !cache.is_expired(existing));
            tracing::debug!(path = %item.path, digest = %item.digest, "Caching file digest");
            items.push(item);
            cache.store(&items)
        })
        .await
    }

    fn is_expired(&self, item: &CacheItem) -> bool {
        let age = Utc::now().signed_duration_since(item.created_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    fn lock(&self) -> Result<File> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                PackError::CacheError(format!(
                    "Failed to open cache lock {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if start.elapsed() < self.lock_timeout => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(PackError::TimeoutError(format!(
                        "Failed to acquire digest cache lock {} within {:?}: {}",
                        path.display(),
                        self.lock_timeout,
                        e
                    )));
                }
            }
        }
    }

    fn load(&self) -> Result<Vec<CacheItem>> {
        let data = self.read()?;
        self.parse(&data)
    }

    /// Like `load`, but a corrupt file counts as empty so the next store
    /// overwrites it.
    fn load_for_update(&self) -> Result<Vec<CacheItem>> {
        let data = self.read()?;
        match self.parse(&data) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt digest cache");
                Ok(Vec::new())
            }
        }
    }

    fn read(&self) -> Result<Vec<u8>> {
        let path = self.dir.join(CACHE_FILE);
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PackError::CacheError(format!(
                "Failed to read digest cache {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn parse(&self, data: &[u8]) -> Result<Vec<CacheItem>> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(data).map_err(|e| {
            PackError::CacheError(format!(
                "Failed to parse digest cache {}: {}",
                self.dir.join(CACHE_FILE).display(),
                e
            ))
        })
    }

    fn store(&self, items: &[CacheItem]) -> Result<()> {
        let path = self.dir.join(CACHE_FILE);
        let tmp = self.dir.join(format!("{}.{}.tmp", CACHE_FILE, uuid::Uuid::new_v4()));
        let data = serde_json::to_vec(items)?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            PackError::CacheError(format!(
                "Failed to write digest cache {}: {}",
                path.display(),
                e
            ))
        })
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PackError::CacheError(format!("digest cache task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> (PathBuf, std::fs::Metadata) {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        (path, meta)
    }

    #[tokio::test]
    async fn test_get_on_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::open(&tmp.path().join("cache")).unwrap();
        assert!(cache.get(Path::new("/no/such")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        let (path, meta) = write_file(tmp.path(), "model.bin", b"weights");

        cache
            .put(CacheItem::new(&path, &meta, "sha256:aa"))
            .await
            .unwrap();

        let item = cache.get(&path).await.unwrap().unwrap();
        assert_eq!(item.digest, "sha256:aa");
        assert!(item.matches(&meta));
        assert!(tmp.path().join(CACHE_FILE).exists());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_item() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        let (path, meta) = write_file(tmp.path(), "model.bin", b"weights");

        cache.put(CacheItem::new(&path, &meta, "sha256:aa")).await.unwrap();
        cache.put(CacheItem::new(&path, &meta, "sha256:bb")).await.unwrap();

        let items = cache.load().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].digest, "sha256:bb");
    }

    #[tokio::test]
    async fn test_expired_items_ignored_and_pruned() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        let (old_path, meta) = write_file(tmp.path(), "old.bin", b"old");
        let (new_path, new_meta) = write_file(tmp.path(), "new.bin", b"new");

        let mut stale = CacheItem::new(&old_path, &meta, "sha256:old");
        stale.created_at = Utc::now() - chrono::Duration::hours(25);
        cache.store(&[stale]).unwrap();

        assert!(cache.get(&old_path).await.unwrap().is_none());

        cache
            .put(CacheItem::new(&new_path, &new_meta, "sha256:new"))
            .await
            .unwrap();
        let items = cache.load().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].digest, "sha256:new");
    }

    #[tokio::test]
    async fn test_matches_detects_changes() {
        let tmp = TempDir::new().unwrap();
        let (path, meta) = write_file(tmp.path(), "model.bin", b"weights");
        let item = CacheItem::new(&path, &meta, "sha256:aa");

        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000, 1)).unwrap();
        let touched = std::fs::metadata(&path).unwrap();
        assert!(!item.matches(&touched));

        let (_, grown) = write_file(tmp.path(), "model.bin", b"weights and more");
        assert!(!item.matches(&grown));
    }

    #[tokio::test]
    async fn test_empty_file_is_empty_cache() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CACHE_FILE), b"  \n").unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        assert!(cache.get(Path::new("/x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_cache_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CACHE_FILE), b"{oops").unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        let err = cache.get(Path::new("/x")).await.unwrap_err();
        assert!(matches!(err, PackError::CacheError(_)));
    }

    #[tokio::test]
    async fn test_put_repairs_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CACHE_FILE), b"\x00garbage{[").unwrap();
        let cache = DigestCache::open(tmp.path()).unwrap();
        let (path, meta) = write_file(tmp.path(), "model.bin", b"weights");

        cache.put(CacheItem::new(&path, &meta, "sha256:aa")).await.unwrap();
        let item = cache.get(&path).await.unwrap().unwrap();
        assert_eq!(item.digest, "sha256:aa");
        assert_eq!(cache.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::open(tmp.path())
            .unwrap()
            .with_lock_timeout(Duration::from_millis(250));

        let held = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(tmp.path().join(LOCK_FILE))
            .unwrap();
        held.lock_exclusive().unwrap();

        let err = cache.get(Path::new("/x")).await.unwrap_err();
        assert!(matches!(err, PackError::TimeoutError(_)));

        held.unlock().unwrap();
        assert!(cache.get(Path::new("/x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let (path, meta) = write_file(tmp.path(), "model.bin", b"weights");
        DigestCache::open(tmp.path())
            .unwrap()
            .put(CacheItem::new(&path, &meta, "sha256:aa"))
            .await
            .unwrap();

        let reopened = DigestCache::open(tmp.path()).unwrap();
        assert_eq!(reopened.get(&path).await.unwrap().unwrap().digest, "sha256:aa");
    }
}
