//! `extract`: write an artifact's files into a directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use modpack_core::error::{PackError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::cache::{CacheItem, DigestCache};
use crate::codec;
use crate::digest::HashingReader;
use crate::reference::ModelReference;
use crate::spec::{Descriptor, Manifest};
use crate::store::Storage;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub output: PathBuf,
    /// Layers decoded in parallel
    pub concurrency: usize,
}

impl Backend {
    pub async fn extract(
        &self,
        target: &str,
        options: &ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse the target"))?;
        let repo = reference.repo();
        tracing::info!(target, output = %options.output.display(), "Extracting artifact");

        let (body, _) = self
            .store
            .pull_manifest(&repo, reference.reference())
            .await
            .map_err(|e| e.context("failed to pull the manifest from storage"))?;
        let manifest = Manifest::from_slice(&body)?;

        extract_layers(
            self.store.clone(),
            &repo,
            manifest.layers,
            &options.output,
            options.concurrency,
            self.cache(),
            cancel,
        )
        .await?;

        tracing::info!(target, "Extracted artifact");
        Ok(())
    }
}

/// Decode `layers` from `store` into `output` with bounded concurrency.
pub(super) async fn extract_layers(
    store: Arc<dyn Storage>,
    repo: &str,
    layers: Vec<Descriptor>,
    output: &Path,
    concurrency: usize,
    cache: Option<DigestCache>,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(output).await?;
    let run = cancel.child_token();
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for layer in layers {
        let store = store.clone();
        let repo = repo.to_string();
        let output = output.to_path_buf();
        let cache = cache.clone();
        let permits = permits.clone();
        let run = run.clone();
        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = run.cancelled() => return Err(PackError::Cancelled),
                permit = permits.acquire_owned() => permit
                    .map_err(|e| PackError::Other(format!("semaphore closed: {}", e)))?,
            };
            let result = tokio::select! {
                _ = run.cancelled() => Err(PackError::Cancelled),
                result = extract_layer(store.as_ref(), &repo, &layer, &output, cache.as_ref()) => result,
            };
            if result.is_err() {
                run.cancel();
            }
            result.map_err(|e| e.context(format!("failed to extract layer {}", layer.digest)))
        });
    }

    let mut first_error: Option<PackError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| PackError::Other(format!("extract task failed: {}", e)))
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

/// Whether the raw layer's target file already holds the layer content.
async fn up_to_date(cache: &DigestCache, path: &Path, layer: &Descriptor) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    match cache.get(path).await {
        Ok(Some(item)) => item.matches(&meta) && item.digest == layer.digest && item.size == layer.size,
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read digest cache");
            false
        }
    }
}

async fn extract_layer(
    store: &dyn Storage,
    repo: &str,
    layer: &Descriptor,
    output: &Path,
    cache: Option<&DigestCache>,
) -> Result<()> {
    let filepath = layer.filepath();
    let codec = codec::for_media_type(&layer.media_type)?;
    let raw = codec::is_raw_media_type(&layer.media_type);
    let target = if raw {
        Some(codec::safe_join(output, Path::new(filepath))?)
    } else {
        None
    };

    if let (Some(cache), Some(target)) = (cache, &target) {
        if up_to_date(cache, target, layer).await {
            tracing::debug!(path = %target.display(), digest = %layer.digest, "File up to date, skipping");
            return Ok(());
        }
    }

    let blob = store
        .pull_blob(repo, &layer.digest)
        .await
        .map_err(|e| e.context("failed to pull the blob from storage"))?;
    let reader = HashingReader::new(blob);
    let state = reader.state();
    codec
        .decode(Box::new(reader), output, filepath, layer)
        .await
        .map_err(|e| e.context(format!("failed to decode the layer {}", layer.digest)))?;

    let (digest, _) = state.finish();
    if digest != layer.digest {
        return Err(PackError::DigestMismatch {
            expected: layer.digest.clone(),
            actual: digest,
        });
    }

    if let (Some(cache), Some(target)) = (cache, target) {
        match tokio::fs::metadata(&target).await {
            Ok(meta) => {
                if let Err(e) = cache.put(CacheItem::new(&target, &meta, &layer.digest)).await {
                    tracing::warn!(path = %target.display(), error = %e, "Failed to update digest cache");
                }
            }
            Err(e) => tracing::warn!(path = %target.display(), error = %e, "Failed to stat extracted file"),
        }
    }
    tracing::debug!(path = filepath, digest = %layer.digest, "Extracted layer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_backend;
    use super::super::BuildOptions;
    use super::*;
    use tempfile::TempDir;

    const SPEC: &str = "name: m\nconfig: [config.json]\nmodel: [weights/*.bin]\ncode: [src/train.py]\n";

    async fn built(raw: bool) -> (TempDir, TempDir, Backend) {
        let work = TempDir::new().unwrap();
        std::fs::create_dir_all(work.path().join("weights")).unwrap();
        std::fs::create_dir_all(work.path().join("src")).unwrap();
        std::fs::write(work.path().join("config.json"), b"{}").unwrap();
        std::fs::write(work.path().join("weights/a.bin"), b"aaaa").unwrap();
        std::fs::write(work.path().join("weights/b.bin"), b"bbbbbb").unwrap();
        std::fs::write(work.path().join("src/train.py"), b"print(1)").unwrap();
        std::fs::write(work.path().join("modpack.yaml"), SPEC).unwrap();

        let state = TempDir::new().unwrap();
        let backend = test_backend(&state);
        let options = BuildOptions {
            raw,
            ..Default::default()
        };
        backend
            .build(&work.path().join("modpack.yaml"), work.path(), "example.com/m:v1", &options, &CancellationToken::new())
            .await
            .unwrap();
        (work, state, backend)
    }

    fn options(dir: &Path) -> ExtractOptions {
        ExtractOptions {
            output: dir.to_path_buf(),
            concurrency: 3,
        }
    }

    #[tokio::test]
    async fn test_extract_raw_layers() {
        let (_work, _state, backend) = built(true).await;
        let out = TempDir::new().unwrap();
        backend
            .extract("example.com/m:v1", &options(out.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.path().join("weights/a.bin")).unwrap(), b"aaaa");
        assert_eq!(std::fs::read(out.path().join("weights/b.bin")).unwrap(), b"bbbbbb");
        assert_eq!(std::fs::read(out.path().join("src/train.py")).unwrap(), b"print(1)");
    }

    #[tokio::test]
    async fn test_extract_tar_layers() {
        let (_work, _state, backend) = built(false).await;
        let out = TempDir::new().unwrap();
        backend
            .extract("example.com/m:v1", &options(out.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.path().join("config.json")).unwrap(), b"{}");
        assert_eq!(std::fs::read(out.path().join("weights/b.bin")).unwrap(), b"bbbbbb");
    }

    #[tokio::test]
    async fn test_second_extract_skips_up_to_date_files() {
        let (_work, state, backend) = built(true).await;
        let out = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        backend.extract("example.com/m:v1", &options(out.path()), &cancel).await.unwrap();

        let cache = DigestCache::open(&state.path().join("cache")).unwrap();
        let target = out.path().join("weights/a.bin");
        let first = cache.get(&target).await.unwrap().unwrap();

        backend.extract("example.com/m:v1", &options(out.path()), &cancel).await.unwrap();
        let second = cache.get(&target).await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_modified_file_is_rewritten() {
        let (_work, _state, backend) = built(true).await;
        let out = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        backend.extract("example.com/m:v1", &options(out.path()), &cancel).await.unwrap();

        std::fs::write(out.path().join("weights/a.bin"), b"tampered").unwrap();
        backend.extract("example.com/m:v1", &options(out.path()), &cancel).await.unwrap();
        assert_eq!(std::fs::read(out.path().join("weights/a.bin")).unwrap(), b"aaaa");
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_digest_check() {
        let (_work, state, backend) = built(true).await;
        let (body, _) = backend.store().pull_manifest("example.com/m", "v1").await.unwrap();
        let manifest = Manifest::from_slice(&body).unwrap();
        let layer = manifest.layers.iter().find(|l| l.filepath() == "weights/a.bin").unwrap();
        let hex = layer.digest.strip_prefix("sha256:").unwrap();
        std::fs::write(
            state.path().join("content/example.com/m/blobs/sha256").join(hex),
            b"zzzz",
        )
        .unwrap();

        let out = TempDir::new().unwrap();
        let err = backend
            .extract("example.com/m:v1", &options(out.path()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::DigestMismatch { .. }));
    }
}
