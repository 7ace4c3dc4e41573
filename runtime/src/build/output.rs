//! Where built blobs go.
//!
//! `LocalOutput` writes every blob into the local content store and lets the
//! store deduplicate. `RemoteOutput` checks the registry first and skips
//! content that is already there.

use std::sync::Arc;

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};

use super::hooks::Hooks;
use crate::spec::{Descriptor, ANNOTATION_FILEPATH};
use crate::store::Storage;
use crate::BoxReader;

/// Output strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Local,
    Remote,
}

/// Destination for layers, config and manifest of one build.
#[async_trait]
pub trait OutputStrategy: Send + Sync {
    async fn output_layer(
        &self,
        media_type: &str,
        rel_path: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor>;

    async fn output_config(
        &self,
        media_type: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor>;

    /// Store the manifest and bind the build's tag to it.
    async fn output_manifest(
        &self,
        media_type: &str,
        digest: &str,
        body: &[u8],
        hooks: &Hooks,
    ) -> Result<Descriptor>;
}

/// Output strategy of `kind` writing to `repo` and tagging `tag`.
pub fn new_output(
    kind: OutputKind,
    store: Arc<dyn Storage>,
    repo: &str,
    tag: &str,
) -> Arc<dyn OutputStrategy> {
    match kind {
        OutputKind::Local => Arc::new(LocalOutput::new(store, repo, tag)),
        OutputKind::Remote => Arc::new(RemoteOutput::new(store, repo, tag)),
    }
}

fn layer_descriptor(media_type: &str, rel_path: &str, digest: &str, size: u64) -> Descriptor {
    let mut desc = Descriptor::new(media_type, digest, size);
    desc.annotations
        .insert(ANNOTATION_FILEPATH.to_string(), rel_path.to_string());
    desc
}

/// Report a failed stage through the hooks, then attach context.
fn fail(hooks: &Hooks, name: &str, err: PackError, context: &str) -> PackError {
    hooks.error(name, &err);
    err.context(context)
}

/// Writes straight into the local content store.
pub struct LocalOutput {
    store: Arc<dyn Storage>,
    repo: String,
    tag: String,
}

impl LocalOutput {
    pub fn new(store: Arc<dyn Storage>, repo: &str, tag: &str) -> Self {
        Self {
            store,
            repo: repo.to_string(),
            tag: tag.to_string(),
        }
    }

    async fn push(&self, name: &str, desc: Descriptor, reader: BoxReader, hooks: &Hooks, context: &str) -> Result<Descriptor> {
        let reader = hooks.start(name, desc.size, reader);
        match self.store.push_blob(&self.repo, reader, Some(&desc)).await {
            Ok(_) => {
                hooks.complete(name, &desc);
                Ok(desc)
            }
            Err(e) => Err(fail(hooks, name, e, context)),
        }
    }
}

#[async_trait]
impl OutputStrategy for LocalOutput {
    async fn output_layer(
        &self,
        media_type: &str,
        rel_path: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = layer_descriptor(media_type, rel_path, digest, size);
        self.push(rel_path, desc, reader, hooks, "failed to push layer to storage")
            .await
    }

    async fn output_config(
        &self,
        media_type: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = Descriptor::new(media_type, digest, size);
        self.push(digest, desc, reader, hooks, "failed to push config to storage")
            .await
    }

    async fn output_manifest(
        &self,
        media_type: &str,
        digest: &str,
        body: &[u8],
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = Descriptor::new(media_type, digest, body.len() as u64);
        hooks
            .drain(digest, desc.size, Box::new(std::io::Cursor::new(body.to_vec())))
            .await
            .map_err(|e| fail(hooks, digest, e, "failed to read manifest"))?;
        let stored = self
            .store
            .push_manifest(&self.repo, &self.tag, body)
            .await
            .map_err(|e| fail(hooks, digest, e, "failed to push manifest to storage"))?;
        if stored != digest {
            let err = PackError::DigestMismatch {
                expected: digest.to_string(),
                actual: stored,
            };
            return Err(fail(hooks, digest, err, "failed to push manifest to storage"));
        }
        hooks.complete(digest, &desc);
        Ok(desc)
    }
}

/// Pushes to a remote registry, skipping content it already has.
pub struct RemoteOutput {
    store: Arc<dyn Storage>,
    repo: String,
    tag: String,
}

impl RemoteOutput {
    pub fn new(store: Arc<dyn Storage>, repo: &str, tag: &str) -> Self {
        Self {
            store,
            repo: repo.to_string(),
            tag: tag.to_string(),
        }
    }

    async fn push_blob(&self, name: &str, desc: Descriptor, reader: BoxReader, hooks: &Hooks, what: &str) -> Result<Descriptor> {
        let reader = hooks.start(name, desc.size, reader);
        let exists = self
            .store
            .stat_blob(&self.repo, &desc.digest)
            .await
            .map_err(|e| fail(hooks, name, e, "failed to check if blob exists"))?;
        if exists {
            tracing::debug!(repo = %self.repo, digest = %desc.digest, "Blob exists on remote, skipping");
            hooks.complete(name, &desc);
            return Ok(desc);
        }

        self.store
            .push_blob(&self.repo, reader, Some(&desc))
            .await
            .map_err(|e| fail(hooks, name, e, &format!("failed to push {} to storage", what)))?;
        hooks.complete(name, &desc);
        Ok(desc)
    }

    /// Bind the tag unless it already resolves to `digest`.
    async fn bind_tag(&self, digest: &str, body: &[u8]) -> Result<()> {
        if let Ok((_, current)) = self.store.pull_manifest(&self.repo, &self.tag).await {
            if current == digest {
                return Ok(());
            }
        }
        self.store.push_manifest(&self.repo, &self.tag, body).await?;
        Ok(())
    }
}

#[async_trait]
impl OutputStrategy for RemoteOutput {
    async fn output_layer(
        &self,
        media_type: &str,
        rel_path: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = layer_descriptor(media_type, rel_path, digest, size);
        self.push_blob(rel_path, desc, reader, hooks, "layer").await
    }

    async fn output_config(
        &self,
        media_type: &str,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = Descriptor::new(media_type, digest, size);
        self.push_blob(digest, desc, reader, hooks, "config").await
    }

    async fn output_manifest(
        &self,
        media_type: &str,
        digest: &str,
        body: &[u8],
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let desc = Descriptor::new(media_type, digest, body.len() as u64);
        hooks
            .drain(digest, desc.size, Box::new(std::io::Cursor::new(body.to_vec())))
            .await
            .map_err(|e| fail(hooks, digest, e, "failed to read manifest"))?;

        let exists = self
            .store
            .stat_manifest(&self.repo, digest)
            .await
            .map_err(|e| fail(hooks, digest, e, "failed to check if manifest exists"))?;

        if !exists {
            self.store
                .push_manifest(&self.repo, digest, body)
                .await
                .map_err(|e| fail(hooks, digest, e, "failed to push manifest to storage"))?;
        } else {
            tracing::debug!(repo = %self.repo, digest, "Manifest exists on remote, skipping push");
        }

        self.bind_tag(digest, body)
            .await
            .map_err(|e| fail(hooks, digest, e, "failed to tag manifest"))?;

        hooks.complete(digest, &desc);
        Ok(desc)
    }
}
