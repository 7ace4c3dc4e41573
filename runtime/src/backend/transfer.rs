//! `push` and `pull`: copy artifacts between the local store and a registry.

use std::sync::Arc;

use modpack_core::error::{PackError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::build::Hooks;
use crate::digest::is_digest;
use crate::reference::ModelReference;
use crate::retry::RetryPolicy;
use crate::spec::{Descriptor, Manifest};
use crate::store::Storage;

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Blobs copied in parallel; falls back to the configured concurrency
    pub concurrency: Option<usize>,
    pub plain_http: bool,
    pub insecure: bool,
}

/// One copy between two stores sharing a repository key.
struct Copy<'a> {
    src: Arc<dyn Storage>,
    dst: Arc<dyn Storage>,
    repo: &'a str,
    retry: RetryPolicy,
    cancel: &'a CancellationToken,
}

impl Backend {
    /// Upload a locally stored artifact to its registry.
    pub async fn push(
        &self,
        target: &str,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse the target"))?;
        let remote = self.remote(&reference.registry, options.plain_http, options.insecure)?;
        tracing::info!(target = %reference, "Pushing artifact");
        let desc = self
            .copy(self.store.clone(), remote, &reference, options, cancel)
            .await
            .map_err(|e| e.context("failed to push artifact"))?;
        tracing::info!(target = %reference, digest = %desc.digest, "Pushed artifact");
        Ok(desc)
    }

    /// Download an artifact from its registry into the local store.
    pub async fn pull(
        &self,
        target: &str,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse the target"))?;
        let remote = self.remote(&reference.registry, options.plain_http, options.insecure)?;
        tracing::info!(target = %reference, "Pulling artifact");
        let desc = self
            .copy(remote, self.store.clone(), &reference, options, cancel)
            .await
            .map_err(|e| e.context("failed to pull artifact"))?;
        tracing::info!(target = %reference, digest = %desc.digest, "Pulled artifact");
        Ok(desc)
    }

    /// Layers first, then config, then manifest, then the tag.
    async fn copy(
        &self,
        src: Arc<dyn Storage>,
        dst: Arc<dyn Storage>,
        reference: &ModelReference,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let repo = reference.repo();
        let (body, digest) = src
            .pull_manifest(&repo, reference.reference())
            .await
            .map_err(|e| e.context("failed to pull the manifest"))?;
        let manifest = Manifest::from_slice(&body)?;

        let run = cancel.child_token();
        let copier = Copy {
            src,
            dst,
            repo: &repo,
            retry: self.retry,
            cancel: &run,
        };

        let concurrency = options.concurrency.unwrap_or(self.config.concurrency).max(1);
        copier
            .blobs(&manifest.layers, concurrency, &self.hooks("Copying blob"))
            .await?;
        copier
            .blobs(std::slice::from_ref(&manifest.config), 1, &self.hooks("Copying config"))
            .await?;

        let desc = Descriptor::new(manifest.media_type.clone(), digest, body.len() as u64);
        copier
            .manifest(&desc, &body, reference.tag.as_deref(), &self.hooks("Copying manifest"))
            .await?;
        Ok(desc)
    }
}

impl Copy<'_> {
    /// Copy blobs with bounded concurrency, skipping those already present.
    async fn blobs(&self, descs: &[Descriptor], concurrency: usize, hooks: &Hooks) -> Result<()> {
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for desc in descs.iter().cloned() {
            let (src, dst) = (self.src.clone(), self.dst.clone());
            let repo = self.repo.to_string();
            let retry = self.retry;
            let run = self.cancel.clone();
            let permits = permits.clone();
            let hooks = hooks.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = run.cancelled() => return Err(PackError::Cancelled),
                    permit = permits.acquire_owned() => permit
                        .map_err(|e| PackError::Other(format!("semaphore closed: {}", e)))?,
                };
                let result = retry
                    .run(&run, &desc.digest, || {
                        copy_blob(src.as_ref(), dst.as_ref(), &repo, &desc, &hooks)
                    })
                    .await;
                if result.is_err() {
                    run.cancel();
                }
                result
            });
        }

        let mut first_error: Option<PackError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| PackError::Other(format!("copy task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                let replace = match &first_error {
                    None => true,
                    Some(existing) => {
                        matches!(existing, PackError::Cancelled) && !matches!(e, PackError::Cancelled)
                    }
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Copy the manifest if missing, then bind `tag` unless it already
    /// resolves to it.
    async fn manifest(&self, desc: &Descriptor, body: &[u8], tag: Option<&str>, hooks: &Hooks) -> Result<()> {
        let name = desc.digest.as_str();
        if let Err(e) = hooks
            .drain(name, desc.size, Box::new(std::io::Cursor::new(body.to_vec())))
            .await
        {
            hooks.error(name, &e);
            return Err(e.context("failed to read manifest"));
        }
        let dst = self.dst.as_ref();
        let result = self
            .retry
            .run(self.cancel, name, || copy_manifest(dst, self.repo, desc, body, tag))
            .await;

        match result {
            Ok(()) => {
                hooks.complete(name, desc);
                Ok(())
            }
            Err(e) => {
                hooks.error(name, &e);
                Err(e.context("failed to copy manifest"))
            }
        }
    }
}

async fn copy_manifest(
    dst: &dyn Storage,
    repo: &str,
    desc: &Descriptor,
    body: &[u8],
    tag: Option<&str>,
) -> Result<()> {
    if dst.stat_manifest(repo, &desc.digest).await? {
        tracing::debug!(repo, digest = %desc.digest, "Manifest exists, skipping");
    } else {
        dst.push_manifest(repo, &desc.digest, body).await?;
    }

    let Some(tag) = tag.filter(|t| !is_digest(t)) else {
        return Ok(());
    };
    let bound = matches!(
        dst.pull_manifest(repo, tag).await,
        Ok((_, current)) if current == desc.digest
    );
    if !bound {
        dst.push_manifest(repo, tag, body)
            .await
            .map_err(|e| e.context(format!("failed to push tag {}", tag)))?;
    }
    Ok(())
}

async fn copy_blob(
    src: &dyn Storage,
    dst: &dyn Storage,
    repo: &str,
    desc: &Descriptor,
    hooks: &Hooks,
) -> Result<()> {
    let name = desc.digest.as_str();
    if dst.stat_blob(repo, name).await? {
        tracing::debug!(repo, digest = name, "Blob exists, skipping");
        hooks.drain(name, desc.size, Box::new(tokio::io::empty())).await?;
        hooks.complete(name, desc);
        return Ok(());
    }

    let reader = src
        .pull_blob(repo, name)
        .await
        .map_err(|e| e.context(format!("failed to pull blob {}", name)))?;
    let reader = hooks.start(name, desc.size, reader);
    match dst.push_blob(repo, reader, Some(desc)).await {
        Ok(_) => {
            hooks.complete(name, desc);
            Ok(())
        }
        Err(e) => {
            hooks.error(name, &e);
            Err(e.context(format!("failed to push blob {}", name)))
        }
    }
}
