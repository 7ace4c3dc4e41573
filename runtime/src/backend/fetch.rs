//! `fetch`: download selected files of a remote artifact.

use std::path::PathBuf;

use modpack_core::error::{PackError, Result};
use tokio_util::sync::CancellationToken;

use super::extract::extract_layers;
use super::Backend;
use crate::reference::ModelReference;
use crate::spec::{Descriptor, Manifest};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub output: PathBuf,
    /// Glob patterns matched against layer filepaths
    pub patterns: Vec<String>,
    /// Layers downloaded in parallel; falls back to the configured concurrency
    pub concurrency: Option<usize>,
    pub plain_http: bool,
    pub insecure: bool,
}

impl Backend {
    /// Write the files of the remote artifact `target` that match any of the
    /// patterns into the output directory. Returns the fetched layers.
    pub async fn fetch(
        &self,
        target: &str,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse the target"))?;
        let patterns = options
            .patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| PackError::InvalidInput(format!("invalid pattern {}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        if patterns.is_empty() {
            return Err(PackError::InvalidInput("at least one pattern is required".to_string()));
        }

        let repo = reference.repo();
        let remote = self.remote(&reference.registry, options.plain_http, options.insecure)?;
        let (body, _) = remote
            .pull_manifest(&repo, reference.reference())
            .await
            .map_err(|e| e.context("failed to fetch the manifest"))?;
        let manifest = Manifest::from_slice(&body)?;

        let layers: Vec<Descriptor> = manifest
            .layers
            .into_iter()
            .filter(|l| patterns.iter().any(|p| p.matches(l.filepath())))
            .collect();
        if layers.is_empty() {
            return Err(PackError::NotFound(format!(
                "no layers of {} matched the patterns",
                target
            )));
        }
        tracing::info!(target, layers = layers.len(), output = %options.output.display(), "Fetching files");

        extract_layers(
            remote,
            &repo,
            layers.clone(),
            &options.output,
            options.concurrency.unwrap_or(self.config.concurrency),
            None,
            cancel,
        )
        .await
        .map_err(|e| e.context("failed to fetch layers"))?;

        tracing::info!(target, "Fetched files");
        Ok(layers)
    }
}
