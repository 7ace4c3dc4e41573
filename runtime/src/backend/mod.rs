//! Artifact lifecycle operations over the content store.
//!
//! `Backend` owns the local store handle and the configuration; every CLI
//! command maps onto one method here.

mod attach;
mod build;
pub mod buildspec;
mod extract;
mod fetch;
mod list;
mod transfer;

pub use attach::AttachOptions;
pub use build::BuildOptions;
pub use buildspec::BuildSpec;
pub use extract::ExtractOptions;
pub use fetch::FetchOptions;
pub use list::{Artifact, InspectedArtifact, InspectedLayer};
pub use transfer::TransferOptions;

use std::sync::Arc;
use std::time::Duration;

use modpack_core::error::{PackError, Result};
use modpack_core::PackConfig;

use crate::build::{Hooks, ProgressObserver};
use crate::cache::DigestCache;
use crate::reference::ModelReference;
use crate::retry::RetryPolicy;
use crate::spec::Manifest;
use crate::store::{
    self, LocalStore, PruneReport, RegistryAuth, RemoteOptions, RemoteStore, Storage,
};

/// Opens the store of a remote registry.
pub type RemoteFactory = Arc<dyn Fn(&str, RemoteOptions) -> Result<Arc<dyn Storage>> + Send + Sync>;

fn default_remote_factory() -> RemoteFactory {
    Arc::new(|registry: &str, options: RemoteOptions| {
        Ok(Arc::new(RemoteStore::new(registry, options)?) as Arc<dyn Storage>)
    })
}

pub struct Backend {
    store: Arc<dyn Storage>,
    config: PackConfig,
    remote: RemoteFactory,
    retry: RetryPolicy,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl Backend {
    /// Backend over the local store under the configured storage dir.
    pub fn new(config: PackConfig) -> Result<Self> {
        let store = LocalStore::open(&config.content_dir())?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<dyn Storage>, config: PackConfig) -> Self {
        Self {
            store,
            config,
            remote: default_remote_factory(),
            retry: RetryPolicy::default(),
            observer: None,
        }
    }

    pub fn with_remote_factory(mut self, factory: RemoteFactory) -> Self {
        self.remote = factory;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    fn remote(&self, registry: &str, plain_http: bool, insecure: bool) -> Result<Arc<dyn Storage>> {
        let options = RemoteOptions {
            plain_http: plain_http || self.config.plain_http,
            insecure: insecure || self.config.insecure,
            auth: RegistryAuth::from_env(),
        };
        (self.remote)(registry, options)
    }

    fn hooks(&self, prompt: &str) -> Hooks {
        match &self.observer {
            Some(observer) => Hooks::from_observer(observer.clone(), prompt),
            None => Hooks::default(),
        }
    }

    /// Digest cache, or `None` when it cannot be opened.
    fn cache(&self) -> Option<DigestCache> {
        let dir = self.config.cache_dir();
        match DigestCache::open(&dir) {
            Ok(cache) => Some(
                cache.with_lock_timeout(Duration::from_secs(self.config.lock_timeout_secs)),
            ),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Digest cache disabled");
                None
            }
        }
    }

    /// Remove orphaned blobs from the local store.
    pub async fn prune(&self, dry_run: bool, remove_untagged: bool) -> Result<PruneReport> {
        store::prune(self.store.as_ref(), dry_run, remove_untagged).await
    }

    /// Delete a tag, or a manifest when `target` names a digest. Returns the
    /// removed reference.
    pub async fn remove(&self, target: &str) -> Result<String> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse target"))?;
        let repo = reference.repo();
        let name = reference.reference().to_string();

        self.store
            .delete_manifest(&repo, &name)
            .await
            .map_err(|e| e.context(format!("failed to delete manifest {}", name)))?;
        tracing::info!(repo = %repo, reference = %name, "Removed artifact");
        Ok(name)
    }

    /// Bind `target` to the manifest `source` resolves to, mounting its
    /// blobs into the target repository.
    pub async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let src = ModelReference::parse(source).map_err(|e| e.context("failed to parse source"))?;
        let dst = ModelReference::parse(target).map_err(|e| e.context("failed to parse target"))?;
        if dst.tag.is_none() {
            return Err(PackError::InvalidInput(
                "tag is required for the target".to_string(),
            ));
        }
        let (src_repo, dst_repo) = (src.repo(), dst.repo());

        let (body, digest) = self
            .store
            .pull_manifest(&src_repo, src.reference())
            .await
            .map_err(|e| e.context("failed to pull manifest"))?;
        let manifest = Manifest::from_slice(&body)?;

        if src_repo != dst_repo {
            for desc in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                self.store
                    .mount_blob(&src_repo, &dst_repo, desc)
                    .await
                    .map_err(|e| e.context(format!("failed to mount blob {}", desc.digest)))?;
            }
        }

        self.store
            .push_manifest(&dst_repo, dst.tag_or_default(), &body)
            .await
            .map_err(|e| e.context("failed to push manifest"))?;
        tracing::info!(source, target, digest = %digest, "Tagged artifact");
        Ok(())
    }
}
