//! `attach`: add or replace one file in an existing artifact.

use std::path::{Component, Path};
use std::sync::Arc;

use modpack_core::error::{PackError, Result};
use tokio_util::sync::CancellationToken;

use super::list::read_model_config;
use super::Backend;
use crate::build::{new_output, ArtifactBuilder, Builder, OutputKind};
use crate::processor::{ProcessOptions, Processor};
use crate::reference::ModelReference;
use crate::spec::{Descriptor, LayerCategory, Manifest, ModelConfig};

/// Options of one attach.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Reference the updated artifact is stored under; defaults to the source
    pub target: Option<String>,
    /// Record the file as `dest_dir/<file name>` instead of its relative path
    pub dest_dir: Option<String>,
    /// Category of the file; inferred from its name when absent
    pub category: Option<LayerCategory>,
    /// The file is a model config document replacing the artifact's config
    pub config: bool,
    /// Replace a layer already recorded at the same path
    pub force: bool,
    /// Store the file verbatim rather than as a single-entry tar
    pub raw: bool,
    /// Read the source from and write the result to the registry
    pub output_remote: bool,
    pub plain_http: bool,
    pub insecure: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            target: None,
            dest_dir: None,
            category: None,
            config: false,
            force: false,
            raw: true,
            output_remote: false,
            plain_http: false,
            insecure: false,
        }
    }
}

impl Backend {
    /// Attach `file` (relative to `work_dir`) to the artifact `source`,
    /// returning the manifest descriptor of the result.
    pub async fn attach(
        &self,
        source: &str,
        file: &Path,
        work_dir: &Path,
        options: &AttachOptions,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let src = ModelReference::parse(source)
            .map_err(|e| e.context("failed to parse the source"))?;
        let dst = match &options.target {
            Some(target) => ModelReference::parse(target)
                .map_err(|e| e.context("failed to parse the target"))?,
            None => src.clone(),
        };
        let tag = dst
            .tag
            .clone()
            .ok_or_else(|| PackError::InvalidInput("tag is required for the target".to_string()))?;
        let (src_repo, dst_repo) = (src.repo(), dst.repo());
        let rel = relative_path(file)?;

        let (kind, store) = if options.output_remote {
            if src.registry != dst.registry {
                return Err(PackError::InvalidInput(format!(
                    "source registry {} differs from target registry {}",
                    src.registry, dst.registry
                )));
            }
            let store = self.remote(&dst.registry, options.plain_http, options.insecure)?;
            (OutputKind::Remote, store)
        } else {
            (OutputKind::Local, self.store.clone())
        };

        let (body, digest) = store
            .pull_manifest(&src_repo, src.reference())
            .await
            .map_err(|e| e.context("failed to get source manifest"))?;
        let manifest = Manifest::from_slice(&body)?;
        let source_model = read_model_config(store.as_ref(), &src_repo, &manifest.config)
            .await
            .map_err(|e| e.context("failed to get source model config"))?;
        tracing::info!(source, file = %rel, "Attaching file");

        if src_repo != dst_repo {
            for layer in &manifest.layers {
                store
                    .mount_blob(&src_repo, &dst_repo, layer)
                    .await
                    .map_err(|e| e.context(format!("failed to mount blob {}", layer.digest)))?;
            }
        }

        let mut builder = ArtifactBuilder::new(new_output(kind, store.clone(), &dst_repo, &tag));
        if let Some(cache) = self.cache() {
            builder = builder.with_cache(cache);
        }
        let builder: Arc<dyn Builder> = Arc::new(builder);

        let (layers, model) = if options.config {
            let raw = tokio::fs::read(work_dir.join(&rel)).await.map_err(|e| {
                PackError::InvalidInput(format!("Failed to read config file {}: {}", rel, e))
            })?;
            let model: ModelConfig = serde_json::from_slice(&raw).map_err(|e| {
                PackError::InvalidInput(format!("Failed to decode config file {}: {}", rel, e))
            })?;
            (manifest.layers.clone(), model)
        } else {
            let dest = match &options.dest_dir {
                Some(dir) => {
                    let name = rel.rsplit('/').next().unwrap_or(&rel);
                    Path::new(dir).join(name).to_string_lossy().into_owned()
                }
                None => rel.clone(),
            };

            let mut layers = manifest.layers.clone();
            if let Some(pos) = layers.iter().position(|l| l.filepath() == dest) {
                if !options.force {
                    return Err(PackError::InvalidInput(format!(
                        "file {} already exists, use --force to overwrite it",
                        dest
                    )));
                }
                let replaced = layers.remove(pos);
                tracing::info!(file = %dest, digest = %replaced.digest, "Replacing existing layer");
            }

            let category = options
                .category
                .or_else(|| LayerCategory::for_file(&rel))
                .ok_or_else(|| {
                    PackError::InvalidInput(format!("cannot determine the category of file {}", rel))
                })?;
            let mut processor = Processor::new(
                category.name(),
                category.media_type(options.raw),
                vec![rel.clone()],
            )
            .with_retry(self.retry);
            if let Some(dir) = &options.dest_dir {
                processor = processor.with_dest_dir(dir.clone());
            }
            let process_options = ProcessOptions {
                concurrency: 1,
                observer: self.observer.clone(),
            };
            let added = processor
                .process(builder.clone(), work_dir, cancel, &process_options)
                .await
                .map_err(|e| e.context("failed to process layers"))?;
            layers.extend(added);
            sort_layers(&mut layers);

            let unchanged = layers
                .iter()
                .map(|l| l.digest.as_str())
                .eq(source_model.modelfs.diff_ids.iter().map(String::as_str));
            if unchanged && src_repo == dst_repo && src.reference() == tag {
                tracing::info!(source, "Artifact unchanged");
                return Ok(Descriptor::new(manifest.media_type, digest, body.len() as u64));
            }
            (layers, source_model)
        };

        let hooks = self.hooks("Building config");
        let config = self
            .retry
            .run(cancel, "config", || builder.build_config(&layers, &model, &hooks))
            .await
            .map_err(|e| e.context("failed to build model config"))?;

        let hooks = self.hooks("Building manifest");
        let built = self
            .retry
            .run(cancel, "manifest", || {
                builder.build_manifest(&layers, &config, manifest.annotations.clone(), &hooks)
            })
            .await
            .map_err(|e| e.context("failed to build model manifest"))?;

        tracing::info!(
            target = %dst,
            digest = %built.digest,
            layers = layers.len(),
            "Attached file"
        );
        Ok(built)
    }
}

/// `file` as a `/`-separated path that stays inside the work directory.
fn relative_path(file: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in file.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(PackError::InvalidInput(format!(
                    "file {} must be relative to the work directory",
                    file.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(PackError::InvalidInput("file path is empty".to_string()));
    }
    Ok(parts.join("/"))
}

/// Group layers by category in manifest order, then by filepath.
fn sort_layers(layers: &mut [Descriptor]) {
    let rank = |d: &Descriptor| {
        LayerCategory::from_media_type(&d.media_type).map_or(LayerCategory::ALL.len(), |c| c as usize)
    };
    layers.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.filepath().cmp(b.filepath())));
}
