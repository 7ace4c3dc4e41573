//! Filesystem content store.
//!
//! Each repository is an OCI image layout under the store root:
//!
//! ```text
//! <root>/<registry>/<repository>/
//! ├── oci-layout
//! ├── index.json
//! ├── blobs/sha256/<hex>
//! └── .uploads/<uuid>
//! ```
//!
//! Blobs are streamed into `.uploads/` while hashed and committed by rename,
//! so writers racing on the same digest converge on identical content.
//! Index updates hold an advisory lock on `.index.lock` in the repository,
//! which serializes them across processes sharing the store.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fs2::FileExt;
use modpack_core::error::{PackError, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{BlobReader, Storage};
use crate::digest::{self, HashingReader};
use crate::spec::{Descriptor, Index, Manifest, ANNOTATION_REF_NAME};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const UPLOADS_DIR: &str = ".uploads";
const INDEX_LOCK_FILE: &str = ".index.lock";
const INDEX_LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Upper bound on waiting for another process's index update.
pub const DEFAULT_INDEX_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Content store on the local filesystem.
pub struct LocalStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on `index.json` within the process;
    /// the file lock covers other processes.
    index_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl LocalStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            PackError::StorageError(format!(
                "Failed to create content store directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            index_lock: Mutex::new(()),
            lock_timeout: DEFAULT_INDEX_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repo: &str) -> Result<PathBuf> {
        validate_repo(repo)?;
        Ok(self.root.join(repo))
    }

    fn blob_path(&self, repo: &str, digest: &str) -> Result<PathBuf> {
        let hex = digest::digest_hex(digest)?;
        Ok(self.repo_dir(repo)?.join(BLOBS_DIR).join("sha256").join(hex))
    }

    async fn ensure_layout(&self, repo: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(repo)?;
        for sub in [dir.join(BLOBS_DIR).join("sha256"), dir.join(UPLOADS_DIR)] {
            tokio::fs::create_dir_all(&sub).await.map_err(|e| {
                PackError::StorageError(format!(
                    "Failed to create directory {}: {}",
                    sub.display(),
                    e
                ))
            })?;
        }

        let layout = dir.join(OCI_LAYOUT_FILE);
        if !layout.exists() {
            write_atomic(&dir, &layout, OCI_LAYOUT_CONTENT.as_bytes()).await?;
        }
        Ok(dir)
    }

    async fn read_index(&self, repo: &str) -> Result<Option<Index>> {
        let path = self.repo_dir(repo)?.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let index = serde_json::from_slice(&data).map_err(|e| {
                    PackError::SerializationError(format!(
                        "Failed to parse index {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(index))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PackError::StorageError(format!(
                "Failed to read index {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_index(&self, repo: &str, index: &Index) -> Result<()> {
        let dir = self.ensure_layout(repo).await?;
        let data = serde_json::to_vec(index)?;
        write_atomic(&dir, &dir.join(INDEX_FILE), &data).await
    }

    /// Apply `update` to the repository index under the index lock.
    async fn update_index<F>(&self, repo: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut Index) -> Result<()>,
    {
        let _guard = self.index_lock.lock().await;
        let dir = self.repo_dir(repo)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            PackError::StorageError(format!("Failed to create directory {}: {}", dir.display(), e))
        })?;
        let _file_lock = lock_index(dir, self.lock_timeout).await?;
        let mut index = self.read_index(repo).await?.unwrap_or_default();
        update(&mut index)?;
        self.write_index(repo, &index).await
    }

    async fn read_blob(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(repo, digest)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PackError::NotFound(format!("{}@{}", repo, digest))
            } else {
                PackError::StorageError(format!("Failed to read {}: {}", path.display(), e))
            }
        })
    }
}

#[async_trait]
impl Storage for LocalStore {
    async fn get_index(&self, repo: &str) -> Result<Index> {
        self.read_index(repo)
            .await?
            .ok_or_else(|| PackError::NotFound(format!("repository {}", repo)))
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        let digest = if digest::is_digest(reference) {
            reference.to_string()
        } else {
            let index = self.get_index(repo).await?;
            index
                .resolve_tag(reference)
                .map(|d| d.digest.clone())
                .ok_or_else(|| PackError::NotFound(format!("{}:{}", repo, reference)))?
        };
        let body = self.read_blob(repo, &digest).await?;
        Ok((body, digest))
    }

    async fn push_manifest(&self, repo: &str, reference: &str, body: &[u8]) -> Result<String> {
        let manifest = Manifest::from_slice(body)?;
        let digest = digest::sha256_digest(body);
        let by_digest = digest::is_digest(reference);
        if by_digest && reference != digest {
            return Err(PackError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest,
            });
        }

        let desc = Descriptor::new(manifest.media_type.clone(), digest.clone(), body.len() as u64);
        self.push_blob(repo, Box::new(std::io::Cursor::new(body.to_vec())), Some(&desc))
            .await?;

        self.update_index(repo, |index| {
            if by_digest {
                if !index.manifests.iter().any(|d| d.digest == digest) {
                    index.manifests.push(desc);
                }
            } else {
                index.manifests.retain(|d| {
                    let tag = Index::tag_of(d);
                    tag != Some(reference) && !(tag.is_none() && d.digest == digest)
                });
                let mut tagged = desc;
                tagged
                    .annotations
                    .insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());
                index.manifests.push(tagged);
            }
            Ok(())
        })
        .await?;

        tracing::debug!(repo, reference, digest = %digest, "Stored manifest");
        Ok(digest)
    }

    async fn stat_manifest(&self, repo: &str, digest: &str) -> Result<bool> {
        self.stat_blob(repo, digest).await
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        if digest::is_digest(reference) {
            let path = self.blob_path(repo, reference)?;
            let mut removed_entries = false;
            if self.read_index(repo).await?.is_some() {
                self.update_index(repo, |index| {
                    let before = index.manifests.len();
                    index.manifests.retain(|d| d.digest != reference);
                    removed_entries = index.manifests.len() != before;
                    Ok(())
                })
                .await?;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !removed_entries {
                        return Err(PackError::NotFound(format!("{}@{}", repo, reference)));
                    }
                }
                Err(e) => {
                    return Err(PackError::StorageError(format!(
                        "Failed to delete manifest {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
            tracing::debug!(repo, digest = %reference, "Deleted manifest");
        } else {
            self.update_index(repo, |index| {
                let before = index.manifests.len();
                index.manifests.retain(|d| Index::tag_of(d) != Some(reference));
                if index.manifests.len() == before {
                    return Err(PackError::NotFound(format!("{}:{}", repo, reference)));
                }
                Ok(())
            })
            .await?;
            tracing::debug!(repo, tag = reference, "Removed tag");
        }
        Ok(())
    }

    async fn pull_blob(&self, repo: &str, digest: &str) -> Result<BlobReader> {
        let path = self.blob_path(repo, digest)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PackError::NotFound(format!("{}@{}", repo, digest))
            } else {
                PackError::StorageError(format!("Failed to open {}: {}", path.display(), e))
            }
        })?;
        Ok(Box::new(file))
    }

    async fn push_blob(
        &self,
        repo: &str,
        body: BlobReader,
        expected: Option<&Descriptor>,
    ) -> Result<(String, u64)> {
        if let Some(desc) = expected {
            let path = self.blob_path(repo, &desc.digest)?;
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.len() == desc.size {
                    tracing::debug!(repo, digest = %desc.digest, "Blob already present");
                    return Ok((desc.digest.clone(), desc.size));
                }
            }
        }

        let dir = self.ensure_layout(repo).await?;
        let tmp = dir.join(UPLOADS_DIR).join(uuid::Uuid::new_v4().to_string());

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut reader = HashingReader::new(body);
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(reader.finish())
        }
        .await;

        let (digest, size) = match written {
            Ok(result) => result,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(PackError::StorageError(format!(
                    "Failed to write blob to {}: {}",
                    tmp.display(),
                    e
                )));
            }
        };

        if let Some(desc) = expected {
            if desc.digest != digest {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(PackError::DigestMismatch {
                    expected: desc.digest.clone(),
                    actual: digest,
                });
            }
            if desc.size != size {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(PackError::InvalidInput(format!(
                    "size mismatch for {}: expected {}, got {}",
                    digest, desc.size, size
                )));
            }
        }

        let target = self.blob_path(repo, &digest)?;
        tokio::fs::rename(&tmp, &target).await.map_err(|e| {
            PackError::StorageError(format!(
                "Failed to commit blob {}: {}",
                target.display(),
                e
            ))
        })?;

        tracing::debug!(repo, digest = %digest, size, "Stored blob");
        Ok((digest, size))
    }

    async fn mount_blob(&self, from: &str, to: &str, desc: &Descriptor) -> Result<()> {
        let source = self.blob_path(from, &desc.digest)?;
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|_| PackError::NotFound(format!("{}@{}", from, desc.digest)))?;
        if meta.len() != desc.size {
            return Err(PackError::InvalidInput(format!(
                "cannot mount {} from {}: size {} does not match descriptor size {}",
                desc.digest,
                from,
                meta.len(),
                desc.size
            )));
        }

        let target = self.blob_path(to, &desc.digest)?;
        if tokio::fs::metadata(&target).await.is_ok() {
            return Ok(());
        }

        let dir = self.ensure_layout(to).await?;
        let tmp = dir.join(UPLOADS_DIR).join(uuid::Uuid::new_v4().to_string());
        if tokio::fs::hard_link(&source, &tmp).await.is_err() {
            tokio::fs::copy(&source, &tmp).await.map_err(|e| {
                PackError::StorageError(format!(
                    "Failed to copy blob {} into {}: {}",
                    desc.digest, to, e
                ))
            })?;
        }
        tokio::fs::rename(&tmp, &target).await.map_err(|e| {
            PackError::StorageError(format!(
                "Failed to commit mounted blob {}: {}",
                target.display(),
                e
            ))
        })?;

        tracing::debug!(from, to, digest = %desc.digest, "Mounted blob");
        Ok(())
    }

    async fn stat_blob(&self, repo: &str, digest: &str) -> Result<bool> {
        let path = self.blob_path(repo, digest)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut repos = Vec::new();
            walk_repositories(&root, &root, &mut repos)?;
            repos.sort();
            Ok(repos)
        })
        .await
        .map_err(|e| PackError::StorageError(format!("repository walk failed: {}", e)))?
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        Ok(self.read_index(repo).await?.unwrap_or_default().tags())
    }

    async fn list_blobs(&self, repo: &str) -> Result<Vec<String>> {
        let dir = self.repo_dir(repo)?.join(BLOBS_DIR).join("sha256");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PackError::StorageError(format!(
                    "Failed to list blobs in {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let digest = format!("{}{}", digest::SHA256_PREFIX, name);
            if digest::validate_digest(&digest).is_ok() {
                blobs.push(digest);
            }
        }
        blobs.sort();
        Ok(blobs)
    }

    async fn cleanup_repo(
        &self,
        repo: &str,
        blobs: &HashSet<String>,
        remove_repo: bool,
    ) -> Result<usize> {
        let mut removed = 0;
        for digest in blobs {
            let path = self.blob_path(repo, digest)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(repo, digest = %digest, "Removed blob");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PackError::StorageError(format!(
                        "Failed to remove blob {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        if remove_repo && self.list_blobs(repo).await?.is_empty() {
            let dir = self.repo_dir(repo)?;
            let _guard = self.index_lock.lock().await;
            let _file_lock = lock_index(dir.clone(), self.lock_timeout).await?;
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                PackError::StorageError(format!(
                    "Failed to remove repository {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            tracing::info!(repo, "Removed empty repository");
        }

        Ok(removed)
    }

    async fn perform_gc(&self, dry_run: bool, remove_untagged: bool) -> Result<Vec<String>> {
        let report = super::gc::prune(self, dry_run, remove_untagged).await?;
        Ok(report.pruned)
    }
}

/// Repository names are `/`-separated plain components; none may be empty
/// or start with a dot.
fn validate_repo(repo: &str) -> Result<()> {
    let valid = !repo.is_empty()
        && repo
            .split('/')
            .all(|part| !part.is_empty() && !part.starts_with('.'));
    if !valid {
        return Err(PackError::InvalidInput(format!(
            "invalid repository name: '{}'",
            repo
        )));
    }
    Ok(())
}

/// A directory is a repository once it holds an index or a blob store; an
/// interrupted first build leaves blobs without an index.
fn walk_repositories(root: &Path, dir: &Path, repos: &mut Vec<String>) -> Result<()> {
    if dir.join(INDEX_FILE).is_file() || dir.join(BLOBS_DIR).join("sha256").is_dir() {
        if let Ok(rel) = dir.strip_prefix(root) {
            let name: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if !name.is_empty() {
                repos.push(name.join("/"));
            }
        }
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(PackError::StorageError(format!(
                "Failed to read {}: {}",
                dir.display(),
                e
            )))
        }
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == BLOBS_DIR || name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            walk_repositories(root, &entry.path(), repos)?;
        }
    }
    Ok(())
}

/// Take the exclusive advisory lock of the repository at `dir`, released when
/// the returned file drops.
async fn lock_index(dir: PathBuf, timeout: Duration) -> Result<File> {
    tokio::task::spawn_blocking(move || {
        let path = dir.join(INDEX_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                PackError::StorageError(format!(
                    "Failed to open index lock {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if start.elapsed() < timeout => std::thread::sleep(INDEX_LOCK_RETRY_DELAY),
                Err(e) => {
                    return Err(PackError::TimeoutError(format!(
                        "Timed out after {:?} waiting for index lock {}: {}",
                        timeout,
                        path.display(),
                        e
                    )))
                }
            }
        }
    })
    .await
    .map_err(|e| PackError::StorageError(format!("index lock task failed: {}", e)))?
}

/// Write `data` to `path` through a temp file in `dir` and a rename.
async fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PackError::StorageError(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{MEDIA_TYPE_MODEL_CONFIG, MEDIA_TYPE_WEIGHT_RAW};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const REPO: &str = "example.com/org/model";

    fn reader(data: &[u8]) -> BlobReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    async fn push(store: &LocalStore, repo: &str, data: &[u8]) -> Descriptor {
        let (digest, size) = store.push_blob(repo, reader(data), None).await.unwrap();
        Descriptor::new(MEDIA_TYPE_WEIGHT_RAW, digest, size)
    }

    async fn manifest_body(store: &LocalStore, repo: &str, layer: &[u8]) -> Vec<u8> {
        let config = push(store, repo, b"{}").await;
        let layer = push(store, repo, layer).await;
        let config = Descriptor::new(MEDIA_TYPE_MODEL_CONFIG, config.digest, config.size);
        Manifest::new(config, vec![layer], BTreeMap::new()).to_vec().unwrap()
    }

    // --- blobs ---

    #[tokio::test]
    async fn test_push_blob_computes_digest() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();

        let (digest, size) = store.push_blob(REPO, reader(b"hello"), None).await.unwrap();
        assert_eq!(digest, digest::sha256_digest(b"hello"));
        assert_eq!(size, 5);
        assert!(store.stat_blob(REPO, &digest).await.unwrap());
        assert!(tmp.path().join(REPO).join(OCI_LAYOUT_FILE).is_file());

        let mut out = Vec::new();
        store
            .pull_blob(REPO, &digest)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_push_blob_digest_mismatch_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let wrong = Descriptor::new(MEDIA_TYPE_WEIGHT_RAW, digest::sha256_digest(b"other"), 5);

        let err = store
            .push_blob(REPO, reader(b"hello"), Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::DigestMismatch { .. }));
        assert!(store.list_blobs(REPO).await.unwrap().is_empty());
        let uploads = std::fs::read_dir(tmp.path().join(REPO).join(UPLOADS_DIR)).unwrap();
        assert_eq!(uploads.count(), 0);
    }

    #[tokio::test]
    async fn test_push_existing_blob_skips_reading() {
        struct Exploding;
        impl tokio::io::AsyncRead for Exploding {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                panic!("body must not be read");
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let desc = push(&store, REPO, b"hello").await;
        let result = store
            .push_blob(REPO, Box::new(Exploding), Some(&desc))
            .await
            .unwrap();
        assert_eq!(result, (desc.digest.clone(), 5));
    }

    #[tokio::test]
    async fn test_concurrent_pushes_of_same_digest_converge() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalStore::open(tmp.path()).unwrap());
        let data = vec![42u8; 256 * 1024];

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                store.push_blob(REPO, reader(&data), None).await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().0, digest::sha256_digest(&data));
        }
        assert_eq!(store.list_blobs(REPO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        assert!(store.stat_blob("../escape", &digest::sha256_digest(b"")).await.is_err());
        assert!(store.stat_blob("/abs", &digest::sha256_digest(b"")).await.is_err());
        assert!(store.stat_blob(REPO, "sha256:../../x").await.is_err());
        assert!(store.pull_blob(REPO, "md5:abc").await.is_err());
    }

    // --- manifests and tags ---

    #[tokio::test]
    async fn test_push_manifest_by_tag_and_pull() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let body = manifest_body(&store, REPO, b"weights").await;

        let digest = store.push_manifest(REPO, "v1", &body).await.unwrap();
        assert_eq!(digest, digest::sha256_digest(&body));

        let (pulled, pulled_digest) = store.pull_manifest(REPO, "v1").await.unwrap();
        assert_eq!(pulled, body);
        assert_eq!(pulled_digest, digest);
        let (by_digest, _) = store.pull_manifest(REPO, &digest).await.unwrap();
        assert_eq!(by_digest, body);
        assert!(store.stat_manifest(REPO, &digest).await.unwrap());
        assert_eq!(store.list_tags(REPO).await.unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_push_manifest_rebinds_tag() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let first = manifest_body(&store, REPO, b"one").await;
        let second = manifest_body(&store, REPO, b"two").await;

        store.push_manifest(REPO, "latest", &first).await.unwrap();
        let d2 = store.push_manifest(REPO, "latest", &second).await.unwrap();

        let index = store.get_index(REPO).await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.resolve_tag("latest").unwrap().digest, d2);
    }

    #[tokio::test]
    async fn test_push_manifest_rejects_garbage_and_wrong_digest() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let err = store.push_manifest(REPO, "v1", b"nope").await.unwrap_err();
        assert!(matches!(err, PackError::SerializationError(_)));

        let body = manifest_body(&store, REPO, b"w").await;
        let err = store
            .push_manifest(REPO, &digest::sha256_digest(b"x"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_delete_by_tag_keeps_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let body = manifest_body(&store, REPO, b"w").await;
        let digest = store.push_manifest(REPO, "v1", &body).await.unwrap();
        store.push_manifest(REPO, "v2", &body).await.unwrap();

        store.delete_manifest(REPO, "v1").await.unwrap();
        assert_eq!(store.list_tags(REPO).await.unwrap(), vec!["v2".to_string()]);
        assert!(store.stat_manifest(REPO, &digest).await.unwrap());

        let err = store.delete_manifest(REPO, "v1").await.unwrap_err();
        assert!(matches!(err, PackError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_by_digest_removes_all_entries() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let body = manifest_body(&store, REPO, b"w").await;
        let digest = store.push_manifest(REPO, "v1", &body).await.unwrap();
        store.push_manifest(REPO, "v2", &body).await.unwrap();

        store.delete_manifest(REPO, &digest).await.unwrap();
        assert!(store.get_index(REPO).await.unwrap().manifests.is_empty());
        assert!(!store.stat_manifest(REPO, &digest).await.unwrap());
        assert!(matches!(
            store.pull_manifest(REPO, "v1").await.unwrap_err(),
            PackError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_push_by_digest_adds_untagged_entry_once() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let body = manifest_body(&store, REPO, b"w").await;
        let digest = digest::sha256_digest(&body);

        store.push_manifest(REPO, &digest, &body).await.unwrap();
        store.push_manifest(REPO, &digest, &body).await.unwrap();
        let index = store.get_index(REPO).await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert!(Index::tag_of(&index.manifests[0]).is_none());

        store.push_manifest(REPO, "v1", &body).await.unwrap();
        let index = store.get_index(REPO).await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(Index::tag_of(&index.manifests[0]), Some("v1"));
    }

    // --- mount, list, cleanup ---

    #[tokio::test]
    async fn test_mount_blob_between_repositories() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let desc = push(&store, REPO, b"shared").await;

        store.mount_blob(REPO, "example.com/other", &desc).await.unwrap();
        assert!(store.stat_blob("example.com/other", &desc.digest).await.unwrap());

        let mut bad = desc.clone();
        bad.size += 1;
        assert!(store.mount_blob(REPO, "example.com/third", &bad).await.is_err());

        let missing = Descriptor::new(MEDIA_TYPE_WEIGHT_RAW, digest::sha256_digest(b"zz"), 2);
        let err = store.mount_blob(REPO, "example.com/other", &missing).await.unwrap_err();
        assert!(matches!(err, PackError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_repositories_sorted() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        for repo in ["z.io/b", "a.io/deep/path/model", "m.io/c"] {
            let body = manifest_body(&store, repo, repo.as_bytes()).await;
            store.push_manifest(repo, "latest", &body).await.unwrap();
        }
        // blobs without an index still form a repository
        push(&store, "q.io/orphan", b"x").await;

        assert_eq!(
            store.list_repositories().await.unwrap(),
            vec!["a.io/deep/path/model", "m.io/c", "q.io/orphan", "z.io/b"]
        );
        assert!(store.list_tags("q.io/orphan").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_repo_counts_and_keeps_repo() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let a = push(&store, REPO, b"a").await;
        let b = push(&store, REPO, b"b").await;

        let set: HashSet<String> = [a.digest.clone(), digest::sha256_digest(b"never")]
            .into_iter()
            .collect();
        assert_eq!(store.cleanup_repo(REPO, &set, false).await.unwrap(), 1);
        assert_eq!(store.list_blobs(REPO).await.unwrap(), vec![b.digest.clone()]);

        let set: HashSet<String> = [b.digest].into_iter().collect();
        assert_eq!(store.cleanup_repo(REPO, &set, false).await.unwrap(), 1);
        assert!(tmp.path().join(REPO).exists());
    }

    #[tokio::test]
    async fn test_cleanup_repo_removes_repo_when_asked() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let a = push(&store, REPO, b"a").await;

        let set: HashSet<String> = [a.digest].into_iter().collect();
        store.cleanup_repo(REPO, &set, true).await.unwrap();
        assert!(!tmp.path().join(REPO).exists());
    }

    #[tokio::test]
    async fn test_index_updates_from_two_stores_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let first = LocalStore::open(tmp.path()).unwrap();
        let second = LocalStore::open(tmp.path()).unwrap();
        let body = manifest_body(&first, REPO, b"weights").await;

        let tags: Vec<String> = (0..16).map(|i| format!("t{}", i)).collect();
        let pushes = tags.iter().enumerate().map(|(i, tag)| {
            let store = if i % 2 == 0 { &first } else { &second };
            let body = body.clone();
            async move { store.push_manifest(REPO, tag, &body).await }
        });
        for result in futures::future::join_all(pushes).await {
            result.unwrap();
        }

        let mut listed = first.list_tags(REPO).await.unwrap();
        listed.sort();
        let mut expected = tags.clone();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_index_update_waits_for_file_lock() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path())
            .unwrap()
            .with_lock_timeout(Duration::from_millis(200));
        let body = manifest_body(&store, REPO, b"weights").await;

        let held = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(tmp.path().join(REPO).join(INDEX_LOCK_FILE))
            .unwrap();
        held.lock_exclusive().unwrap();

        let err = store.push_manifest(REPO, "v1", &body).await.unwrap_err();
        assert!(matches!(err, PackError::TimeoutError(_)));
        assert!(store.list_tags(REPO).await.unwrap().is_empty());

        held.unlock().unwrap();
        store.push_manifest(REPO, "v1", &body).await.unwrap();
        assert_eq!(store.list_tags(REPO).await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_removing_missing_tag_leaves_no_repository() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let err = store.delete_manifest("example.com/none", "v1").await.unwrap_err();
        assert!(matches!(err, PackError::NotFound(_)));
        assert!(store.list_repositories().await.unwrap().is_empty());
    }

    #[test]
    fn test_validate_repo() {
        assert!(validate_repo("docker.io/library/qwen").is_ok());
        assert!(validate_repo("localhost:5000/qwen").is_ok());
        assert!(validate_repo("").is_err());
        assert!(validate_repo("a/../b").is_err());
        assert!(validate_repo("a/./b").is_err());
        assert!(validate_repo("/a").is_err());
        assert!(validate_repo("a/.uploads").is_err());
        assert!(validate_repo("a//b").is_err());
    }
}
