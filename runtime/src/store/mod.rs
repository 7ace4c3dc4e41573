//! Content store.
//!
//! `Storage` is the seam between the build pipeline and where blobs live.
//! `LocalStore` keeps an OCI image layout per repository on disk;
//! `RemoteStore` speaks the OCI distribution API to a registry. Both are
//! handed around as `Arc<dyn Storage>`.

pub mod gc;
pub mod local;
pub mod remote;

pub use gc::{prune, prune_repo, PruneReport};
pub use local::LocalStore;
pub use remote::{RegistryAuth, RemoteOptions, RemoteStore};

use std::collections::HashSet;

use async_trait::async_trait;
use modpack_core::error::Result;

use crate::spec::{Descriptor, Index};
use crate::BoxReader;

/// Reader over blob content.
pub type BlobReader = BoxReader;

/// Content-addressed blob and manifest store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The repository's manifest index.
    async fn get_index(&self, repo: &str) -> Result<Index>;

    /// Manifest bytes and digest for a tag or digest.
    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<(Vec<u8>, String)>;

    /// Store a manifest under a tag or digest, returning its digest.
    async fn push_manifest(&self, repo: &str, reference: &str, body: &[u8]) -> Result<String>;

    async fn stat_manifest(&self, repo: &str, digest: &str) -> Result<bool>;

    /// Untag when `reference` is a tag; delete the manifest when it is a digest.
    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()>;

    async fn pull_blob(&self, repo: &str, digest: &str) -> Result<BlobReader>;

    /// Store a blob. With an expected descriptor the content is verified
    /// against it; without one the digest is computed while streaming.
    async fn push_blob(
        &self,
        repo: &str,
        body: BlobReader,
        expected: Option<&Descriptor>,
    ) -> Result<(String, u64)>;

    /// Make a blob from one repository available in another.
    async fn mount_blob(&self, from: &str, to: &str, desc: &Descriptor) -> Result<()>;

    async fn stat_blob(&self, repo: &str, digest: &str) -> Result<bool>;

    async fn list_repositories(&self) -> Result<Vec<String>>;

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;

    async fn list_blobs(&self, repo: &str) -> Result<Vec<String>>;

    /// Delete `blobs` from a repository, returning how many were removed.
    async fn cleanup_repo(
        &self,
        repo: &str,
        blobs: &HashSet<String>,
        remove_repo: bool,
    ) -> Result<usize>;

    /// Mark-and-sweep over every repository.
    async fn perform_gc(&self, dry_run: bool, remove_untagged: bool) -> Result<Vec<String>>;
}
