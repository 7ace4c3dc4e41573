//! In-memory `Storage` used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::digest::{is_digest, sha256_digest};
use crate::spec::{Descriptor, Index, ANNOTATION_REF_NAME, MEDIA_TYPE_MANIFEST};
use crate::store::{BlobReader, Storage};

#[derive(Default)]
struct Repo {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, Vec<u8>>,
    tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct Counters {
    blob_pushes: usize,
    manifest_pushes: Vec<String>,
    mounts: usize,
    failing_blob_pushes: usize,
    fail_stat: bool,
}

/// Registry-like store with push counters and failure injection.
#[derive(Default)]
pub struct MemoryStore {
    repos: Mutex<HashMap<String, Repo>>,
    counters: Mutex<Counters>,
}

impl MemoryStore {
    pub fn insert_blob(&self, repo: &str, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        self.repos
            .lock()
            .entry(repo.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn blob(&self, repo: &str, digest: &str) -> Option<Vec<u8>> {
        self.repos.lock().get(repo)?.blobs.get(digest).cloned()
    }

    pub fn blob_pushes(&self) -> usize {
        self.counters.lock().blob_pushes
    }

    /// References passed to `push_manifest`, in order.
    pub fn manifest_pushes(&self) -> Vec<String> {
        self.counters.lock().manifest_pushes.clone()
    }

    pub fn mounts(&self) -> usize {
        self.counters.lock().mounts
    }

    pub fn reset_counters(&self) {
        let mut counters = self.counters.lock();
        counters.blob_pushes = 0;
        counters.manifest_pushes.clear();
        counters.mounts = 0;
    }

    pub fn fail_stat(&self, fail: bool) {
        self.counters.lock().fail_stat = fail;
    }

    /// Make the next `count` blob pushes fail with a storage error.
    pub fn fail_blob_pushes(&self, count: usize) {
        self.counters.lock().failing_blob_pushes = count;
    }

    fn with_repo<T>(&self, repo: &str, f: impl FnOnce(&Repo) -> Result<T>) -> Result<T> {
        let repos = self.repos.lock();
        let entry = repos
            .get(repo)
            .ok_or_else(|| PackError::NotFound(format!("repository {}", repo)))?;
        f(entry)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_index(&self, repo: &str) -> Result<Index> {
        self.with_repo(repo, |r| {
            let mut index = Index::default();
            let mut tagged = HashSet::new();
            for (tag, digest) in &r.tags {
                let mut desc = Descriptor::new(MEDIA_TYPE_MANIFEST, digest, r.manifests[digest].len() as u64);
                desc.annotations
                    .insert(ANNOTATION_REF_NAME.to_string(), tag.clone());
                index.manifests.push(desc);
                tagged.insert(digest.clone());
            }
            let mut untagged: Vec<_> = r.manifests.keys().filter(|d| !tagged.contains(*d)).collect();
            untagged.sort();
            for digest in untagged {
                index.manifests.push(Descriptor::new(
                    MEDIA_TYPE_MANIFEST,
                    digest,
                    r.manifests[digest].len() as u64,
                ));
            }
            Ok(index)
        })
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        self.with_repo(repo, |r| {
            let digest = if is_digest(reference) {
                reference.to_string()
            } else {
                r.tags
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| PackError::NotFound(format!("{}:{}", repo, reference)))?
            };
            let body = r
                .manifests
                .get(&digest)
                .cloned()
                .ok_or_else(|| PackError::NotFound(format!("{}@{}", repo, digest)))?;
            Ok((body, digest))
        })
    }

    async fn push_manifest(&self, repo: &str, reference: &str, body: &[u8]) -> Result<String> {
        self.counters.lock().manifest_pushes.push(reference.to_string());
        let digest = sha256_digest(body);
        if is_digest(reference) && reference != digest {
            return Err(PackError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest,
            });
        }
        let mut repos = self.repos.lock();
        let entry = repos.entry(repo.to_string()).or_default();
        entry.manifests.insert(digest.clone(), body.to_vec());
        if !is_digest(reference) {
            entry.tags.insert(reference.to_string(), digest.clone());
        }
        Ok(digest)
    }

    async fn stat_manifest(&self, repo: &str, digest: &str) -> Result<bool> {
        if self.counters.lock().fail_stat {
            return Err(PackError::RegistryError {
                registry: "memory".to_string(),
                message: "stat failed".to_string(),
            });
        }
        Ok(self
            .repos
            .lock()
            .get(repo)
            .map(|r| r.manifests.contains_key(digest))
            .unwrap_or(false))
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let mut repos = self.repos.lock();
        let entry = repos
            .get_mut(repo)
            .ok_or_else(|| PackError::NotFound(format!("repository {}", repo)))?;
        if is_digest(reference) {
            entry
                .manifests
                .remove(reference)
                .ok_or_else(|| PackError::NotFound(format!("{}@{}", repo, reference)))?;
            entry.tags.retain(|_, d| d != reference);
        } else {
            entry
                .tags
                .remove(reference)
                .ok_or_else(|| PackError::NotFound(format!("{}:{}", repo, reference)))?;
        }
        Ok(())
    }

    async fn pull_blob(&self, repo: &str, digest: &str) -> Result<BlobReader> {
        let data = self
            .blob(repo, digest)
            .ok_or_else(|| PackError::NotFound(format!("{}@{}", repo, digest)))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn push_blob(
        &self,
        repo: &str,
        mut body: BlobReader,
        expected: Option<&Descriptor>,
    ) -> Result<(String, u64)> {
        {
            let mut counters = self.counters.lock();
            counters.blob_pushes += 1;
            if counters.failing_blob_pushes > 0 {
                counters.failing_blob_pushes -= 1;
                return Err(PackError::StorageError("injected push failure".to_string()));
            }
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let digest = sha256_digest(&data);
        if let Some(desc) = expected {
            if desc.digest != digest {
                return Err(PackError::DigestMismatch {
                    expected: desc.digest.clone(),
                    actual: digest,
                });
            }
        }
        let size = data.len() as u64;
        self.repos
            .lock()
            .entry(repo.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        Ok((digest, size))
    }

    async fn mount_blob(&self, from: &str, to: &str, desc: &Descriptor) -> Result<()> {
        self.counters.lock().mounts += 1;
        let data = self
            .blob(from, &desc.digest)
            .ok_or_else(|| PackError::NotFound(format!("{}@{}", from, desc.digest)))?;
        self.repos
            .lock()
            .entry(to.to_string())
            .or_default()
            .blobs
            .insert(desc.digest.clone(), data);
        Ok(())
    }

    async fn stat_blob(&self, repo: &str, digest: &str) -> Result<bool> {
        if self.counters.lock().fail_stat {
            return Err(PackError::RegistryError {
                registry: "memory".to_string(),
                message: "stat failed".to_string(),
            });
        }
        Ok(self.blob(repo, digest).is_some())
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repos: Vec<String> = self.repos.lock().keys().cloned().collect();
        repos.sort();
        Ok(repos)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        self.with_repo(repo, |r| Ok(r.tags.keys().cloned().collect()))
    }

    async fn list_blobs(&self, repo: &str) -> Result<Vec<String>> {
        self.with_repo(repo, |r| {
            let mut blobs: Vec<String> = r.blobs.keys().chain(r.manifests.keys()).cloned().collect();
            blobs.sort();
            blobs.dedup();
            Ok(blobs)
        })
    }

    async fn cleanup_repo(
        &self,
        repo: &str,
        blobs: &HashSet<String>,
        remove_repo: bool,
    ) -> Result<usize> {
        let mut repos = self.repos.lock();
        let Some(entry) = repos.get_mut(repo) else {
            return Ok(0);
        };
        let before = entry.blobs.len();
        entry.blobs.retain(|d, _| !blobs.contains(d));
        let removed = before - entry.blobs.len();
        if remove_repo && entry.blobs.is_empty() && entry.manifests.is_empty() {
            repos.remove(repo);
        }
        Ok(removed)
    }

    async fn perform_gc(&self, dry_run: bool, remove_untagged: bool) -> Result<Vec<String>> {
        Ok(crate::store::prune(self, dry_run, remove_untagged).await?.pruned)
    }
}
