//! Turns files into layer, config and manifest blobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modpack_core::error::{PackError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use super::hooks::Hooks;
use super::interceptor::Interceptor;
use super::output::OutputStrategy;
use crate::cache::{CacheItem, DigestCache};
use crate::codec::{self, Codec, EncodedStream};
use crate::digest::{digest_reader, sha256_digest};
use crate::spec::{
    Descriptor, FileMetadata, Manifest, ModelConfig, ANNOTATION_FILE_METADATA,
    MEDIA_TYPE_MANIFEST, MEDIA_TYPE_MODEL_CONFIG,
};
use crate::BoxReader;

/// Capacity of each tee pipe.
const TEE_PIPE_SIZE: usize = 4 * 1024 * 1024;

const PUMP_BUF_SIZE: usize = 64 * 1024;

/// Builds the blobs of one artifact.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Encode one file into a layer. `dest_path` overrides the path recorded
    /// in the layer annotation.
    async fn build_layer(
        &self,
        cancel: CancellationToken,
        media_type: &str,
        work_dir: &Path,
        file_path: &Path,
        dest_path: Option<&str>,
        hooks: &Hooks,
    ) -> Result<Descriptor>;

    async fn build_config(
        &self,
        layers: &[Descriptor],
        model: &ModelConfig,
        hooks: &Hooks,
    ) -> Result<Descriptor>;

    async fn build_manifest(
        &self,
        layers: &[Descriptor],
        config: &Descriptor,
        annotations: BTreeMap<String, String>,
        hooks: &Hooks,
    ) -> Result<Descriptor>;
}

/// Artifact creation time: the explicit value, else the newest layer file
/// mtime, else the Unix epoch.
pub fn resolve_created_at(explicit: Option<DateTime<Utc>>, layers: &[Descriptor]) -> DateTime<Utc> {
    explicit
        .or_else(|| {
            layers
                .iter()
                .filter_map(|l| l.file_metadata())
                .map(|m| m.mtime)
                .max()
        })
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// `Builder` writing through an output strategy.
pub struct ArtifactBuilder {
    output: Arc<dyn OutputStrategy>,
    cache: Option<DigestCache>,
    interceptor: Option<Arc<dyn Interceptor>>,
}

impl ArtifactBuilder {
    pub fn new(output: Arc<dyn OutputStrategy>) -> Self {
        Self {
            output,
            cache: None,
            interceptor: None,
        }
    }

    pub fn with_cache(mut self, cache: DigestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    async fn cached_digest(&self, path: &Path, meta: &std::fs::Metadata) -> Option<(String, u64)> {
        let cache = self.cache.as_ref()?;
        match cache.get(path).await {
            Ok(Some(item)) if item.matches(meta) => {
                tracing::debug!(path = %path.display(), digest = %item.digest, "Digest cache hit");
                Some((item.digest, item.size))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read digest cache");
                None
            }
        }
    }

    async fn remember_digest(&self, path: &Path, meta: &std::fs::Metadata, digest: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(CacheItem::new(path, meta, digest)).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to update digest cache");
            }
        }
    }

    /// Encode `path` and compute its digest, rewinding for the output.
    async fn encode_and_digest(
        &self,
        codec: &dyn Codec,
        path: &Path,
        work_dir: &Path,
    ) -> Result<(EncodedStream, String, u64)> {
        let mut stream = codec
            .encode(path, work_dir)
            .await
            .map_err(|e| e.context("failed to encode file"))?;
        let (digest, size) = digest_reader(&mut stream)
            .await
            .map_err(|e| e.context(format!("failed to compute digest of {}", path.display())))?;
        let stream = stream.rewind(codec, path, work_dir).await?;
        tracing::debug!(path = %path.display(), digest = %digest, size, "Computed layer digest");
        Ok((stream, digest, size))
    }

    /// Feed `reader` to the output and the interceptor at once.
    #[allow(clippy::too_many_arguments)]
    async fn output_with_interceptor(
        &self,
        interceptor: Arc<dyn Interceptor>,
        cancel: &CancellationToken,
        media_type: &str,
        rel_path: &str,
        codec_type: codec::CodecType,
        digest: &str,
        size: u64,
        reader: BoxReader,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let (out_tx, out_rx) = tokio::io::duplex(TEE_PIPE_SIZE);
        let (it_tx, it_rx) = tokio::io::duplex(TEE_PIPE_SIZE);

        let token = cancel.child_token();
        let intercept = {
            let token = token.clone();
            let media_type = media_type.to_string();
            let rel_path = rel_path.to_string();
            tokio::spawn(async move {
                interceptor
                    .intercept(token, &media_type, &rel_path, codec_type, Box::new(it_rx))
                    .await
            })
        };
        let pump = tokio::spawn(pump(reader, out_tx, it_tx));

        let output = self
            .output
            .output_layer(media_type, rel_path, digest, size, Box::new(out_rx), hooks)
            .await;
        if output.is_err() {
            token.cancel();
        }

        let pumped = pump
            .await
            .map_err(|e| PackError::Other(format!("tee task failed: {}", e)))?;
        let intercepted = intercept
            .await
            .map_err(|e| PackError::Other(format!("interceptor task failed: {}", e)))?;

        pumped.map_err(|e| e.context(format!("failed to read layer {}", rel_path)))?;
        let mut desc = output?;
        if let Some(annotations) = intercepted? {
            desc.annotations.extend(annotations);
        }
        Ok(desc)
    }
}

/// Copy `source` into both pipes until the source ends or both readers
/// are gone.
async fn pump(mut source: BoxReader, mut a: DuplexStream, mut b: DuplexStream) -> Result<()> {
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    let (mut a_open, mut b_open) = (true, true);

    while a_open || b_open {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if a_open && a.write_all(&buf[..n]).await.is_err() {
            a_open = false;
        }
        if b_open && b.write_all(&buf[..n]).await.is_err() {
            b_open = false;
        }
    }

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[async_trait]
impl Builder for ArtifactBuilder {
    async fn build_layer(
        &self,
        cancel: CancellationToken,
        media_type: &str,
        work_dir: &Path,
        file_path: &Path,
        dest_path: Option<&str>,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let work_dir = absolute(work_dir)?;
        let path = if file_path.is_absolute() {
            file_path.to_path_buf()
        } else {
            work_dir.join(file_path)
        };

        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            PackError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to stat {}: {}", path.display(), e),
            ))
        })?;
        if meta.is_dir() {
            return Err(PackError::InvalidInput(format!(
                "{} is a directory and not supported yet",
                path.display()
            )));
        }

        let rel = path.strip_prefix(&work_dir).map_err(|_| {
            PackError::InvalidInput(format!(
                "{} is not under work directory {}",
                path.display(),
                work_dir.display()
            ))
        })?;
        let rel_path = dest_path
            .map(str::to_string)
            .unwrap_or_else(|| rel.to_string_lossy().into_owned());

        let codec = codec::for_media_type(media_type)?;
        let raw = codec::is_raw_media_type(media_type);
        tracing::debug!(path = %rel_path, media_type, codec = %codec.codec_type(), "Building layer");

        let cached = if raw {
            self.cached_digest(&path, &meta).await
        } else {
            None
        };
        let (stream, digest, size) = match cached {
            Some((digest, size)) => {
                let stream = codec
                    .encode(&path, &work_dir)
                    .await
                    .map_err(|e| e.context("failed to encode file"))?;
                (stream, digest, size)
            }
            None => {
                let (stream, digest, size) =
                    self.encode_and_digest(codec.as_ref(), &path, &work_dir).await?;
                if raw {
                    self.remember_digest(&path, &meta, &digest).await;
                }
                (stream, digest, size)
            }
        };

        let mut desc = match &self.interceptor {
            Some(interceptor) => {
                self.output_with_interceptor(
                    interceptor.clone(),
                    &cancel,
                    media_type,
                    &rel_path,
                    codec.codec_type(),
                    &digest,
                    size,
                    stream.into_reader(),
                    hooks,
                )
                .await?
            }
            None => {
                self.output
                    .output_layer(media_type, &rel_path, &digest, size, stream.into_reader(), hooks)
                    .await?
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = FileMetadata::from_metadata(&meta, &name);
        desc.annotations.insert(
            ANNOTATION_FILE_METADATA.to_string(),
            serde_json::to_string(&metadata)?,
        );
        Ok(desc)
    }

    async fn build_config(
        &self,
        layers: &[Descriptor],
        model: &ModelConfig,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let mut config = model.clone();
        config.descriptor.created_at =
            Some(resolve_created_at(model.descriptor.created_at, layers));
        config.modelfs.diff_ids = layers.iter().map(|l| l.digest.clone()).collect();

        let body = serde_json::to_vec(&config)?;
        let digest = sha256_digest(&body);
        let size = body.len() as u64;
        self.output
            .output_config(
                MEDIA_TYPE_MODEL_CONFIG,
                &digest,
                size,
                Box::new(std::io::Cursor::new(body)),
                hooks,
            )
            .await
    }

    async fn build_manifest(
        &self,
        layers: &[Descriptor],
        config: &Descriptor,
        annotations: BTreeMap<String, String>,
        hooks: &Hooks,
    ) -> Result<Descriptor> {
        let manifest = Manifest::new(config.clone(), layers.to_vec(), annotations);
        let body = manifest.to_vec()?;
        let digest = sha256_digest(&body);
        self.output
            .output_manifest(MEDIA_TYPE_MANIFEST, &digest, &body, hooks)
            .await
    }
}
