//! `build`: package a work directory into an artifact.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::SecondsFormat;
use modpack_core::error::{PackError, Result};
use tokio_util::sync::CancellationToken;

use super::{Backend, BuildSpec};
use crate::build::{new_output, resolve_created_at, ArtifactBuilder, Builder, ChunkCrcInterceptor, OutputKind};
use crate::processor::{ProcessOptions, Processor};
use crate::reference::ModelReference;
use crate::spec::{Descriptor, LayerCategory, ANNOTATION_BUILDSPEC, ANNOTATION_CREATED};

/// Options of one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Parallel layer builds; falls back to the configured concurrency
    pub concurrency: Option<usize>,
    /// Push straight to the registry instead of the local store
    pub output_remote: bool,
    /// Attach chunk checksums for lazy loading
    pub nydusify: bool,
    /// Store files verbatim (`.raw`) rather than as single-entry tars
    pub raw: bool,
    pub plain_http: bool,
    pub insecure: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            output_remote: false,
            nydusify: false,
            raw: true,
            plain_http: false,
            insecure: false,
        }
    }
}

impl Backend {
    /// Build the files `spec_path` lists under `work_dir` into `target`,
    /// returning the manifest descriptor.
    pub async fn build(
        &self,
        spec_path: &Path,
        work_dir: &Path,
        target: &str,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse target"))?;
        let tag = reference
            .tag
            .clone()
            .ok_or_else(|| PackError::InvalidInput("tag is required".to_string()))?;
        let repo = reference.repo();

        let spec = BuildSpec::from_file(spec_path).await?;

        let (kind, store) = if options.output_remote {
            let store = self.remote(&reference.registry, options.plain_http, options.insecure)?;
            (OutputKind::Remote, store)
        } else {
            (OutputKind::Local, self.store.clone())
        };

        let mut builder = ArtifactBuilder::new(new_output(kind, store, &repo, &tag));
        if let Some(cache) = self.cache() {
            builder = builder.with_cache(cache);
        }
        if options.nydusify {
            builder = builder.with_interceptor(Arc::new(ChunkCrcInterceptor::new()));
        }
        let builder: Arc<dyn Builder> = Arc::new(builder);

        tracing::info!(target = %reference, work_dir = %work_dir.display(), ?kind, "Building artifact");

        let process_options = ProcessOptions {
            concurrency: options.concurrency.unwrap_or(self.config.concurrency),
            observer: self.observer.clone(),
        };
        let mut layers = Vec::new();
        for category in LayerCategory::ALL {
            let patterns = spec.patterns(category);
            if patterns.is_empty() {
                continue;
            }
            let processor = Processor::new(category.name(), category.media_type(options.raw), patterns.to_vec())
                .with_retry(self.retry);
            let descs = processor
                .process(builder.clone(), work_dir, cancel, &process_options)
                .await
                .map_err(|e| e.context("failed to process files"))?;
            layers.extend(descs);
        }

        let model = spec.model_config();
        let hooks = self.hooks("Building config");
        let config = self
            .retry
            .run(cancel, "config", || builder.build_config(&layers, &model, &hooks))
            .await
            .map_err(|e| e.context("failed to build model config"))?;

        let created = resolve_created_at(spec.created, &layers);
        let annotations = BTreeMap::from([
            (ANNOTATION_BUILDSPEC.to_string(), spec.raw.clone()),
            (
                ANNOTATION_CREATED.to_string(),
                created.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]);
        let hooks = self.hooks("Building manifest");
        let manifest = self
            .retry
            .run(cancel, "manifest", || {
                builder.build_manifest(&layers, &config, annotations.clone(), &hooks)
            })
            .await
            .map_err(|e| e.context("failed to build model manifest"))?;

        tracing::info!(
            target = %reference,
            digest = %manifest.digest,
            layers = layers.len(),
            "Built artifact"
        );
        Ok(manifest)
    }
}
