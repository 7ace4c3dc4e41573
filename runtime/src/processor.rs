//! Concurrent layer processing.
//!
//! A `Processor` resolves its patterns under the work directory and builds
//! one layer per matched file, fanning out over a bounded set of tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use modpack_core::error::{PackError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::build::{Builder, Hooks, ProgressObserver};
use crate::retry::RetryPolicy;
use crate::spec::Descriptor;

/// Options of one processor run.
#[derive(Clone, Default)]
pub struct ProcessOptions {
    /// Maximum concurrent layer builds; 0 means 1
    pub concurrency: usize,
    pub observer: Option<Arc<dyn ProgressObserver>>,
}

/// Builds the layers of one artifact category.
#[derive(Debug, Clone)]
pub struct Processor {
    name: String,
    media_type: String,
    patterns: Vec<String>,
    dest_dir: Option<String>,
    retry: RetryPolicy,
}

impl Processor {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            patterns,
            dest_dir: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Record layers as `dest_dir/<file name>` instead of their relative path.
    pub fn with_dest_dir(mut self, dest_dir: impl Into<String>) -> Self {
        self.dest_dir = Some(dest_dir.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Files matched by the patterns under `work_dir`, sorted and deduplicated.
    pub fn matched_paths(&self, work_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for pattern in &self.patterns {
            if !pattern.contains(['*', '?', '[', ']']) {
                let path = work_dir.join(pattern);
                match std::fs::metadata(&path) {
                    Ok(_) => paths.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(PackError::InvalidInput(format!(
                            "file specified in build spec does not exist: {}",
                            pattern
                        )));
                    }
                    Err(e) => {
                        return Err(PackError::IoError(std::io::Error::new(
                            e.kind(),
                            format!("Failed to check file {}: {}", pattern, e),
                        )));
                    }
                }
                continue;
            }

            let full = format!(
                "{}/{}",
                glob::Pattern::escape(&work_dir.to_string_lossy()),
                pattern
            );
            let entries = glob::glob(&full).map_err(|e| {
                PackError::InvalidInput(format!("invalid pattern {}: {}", pattern, e))
            })?;
            for entry in entries {
                let path = entry.map_err(|e| {
                    PackError::IoError(std::io::Error::new(
                        e.error().kind(),
                        format!("Failed to match {}: {}", pattern, e),
                    ))
                })?;
                paths.push(path);
            }
        }

        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Build every matched file, returning descriptors sorted by filepath.
    pub async fn process(
        &self,
        builder: Arc<dyn Builder>,
        work_dir: &Path,
        cancel: &CancellationToken,
        options: &ProcessOptions,
    ) -> Result<Vec<Descriptor>> {
        let work_dir = if work_dir.is_absolute() {
            work_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(work_dir)
        };
        tracing::info!(
            processor = %self.name,
            media_type = %self.media_type,
            patterns = ?self.patterns,
            "Processing files"
        );

        let paths = self.matched_paths(&work_dir)?;
        let hooks = match &options.observer {
            Some(observer) => Hooks::from_observer(observer.clone(), "Building layer"),
            None => Hooks::default(),
        };

        let run = cancel.child_token();
        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for path in paths.iter().cloned() {
            let builder = builder.clone();
            let permits = permits.clone();
            let run = run.clone();
            let hooks = hooks.clone();
            let work_dir = work_dir.clone();
            let media_type = self.media_type.clone();
            let retry = self.retry;
            let name = self.name.clone();
            let dest_path = self.dest_dir.as_ref().map(|dir| {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Path::new(dir).join(file_name).to_string_lossy().into_owned()
            });

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = run.cancelled() => return Err(PackError::Cancelled),
                    permit = permits.acquire_owned() => permit
                        .map_err(|e| PackError::Other(format!("semaphore closed: {}", e)))?,
                };

                let result = retry
                    .run(&run, &path.to_string_lossy(), || {
                        tracing::debug!(processor = %name, path = %path.display(), "Building layer");
                        builder.build_layer(
                            run.clone(),
                            &media_type,
                            &work_dir,
                            &path,
                            dest_path.as_deref(),
                            &hooks,
                        )
                    })
                    .await;

                match result {
                    Ok(desc) => {
                        tracing::debug!(
                            processor = %name,
                            path = %path.display(),
                            digest = %desc.digest,
                            size = desc.size,
                            "Built layer"
                        );
                        Ok(desc)
                    }
                    Err(e) => {
                        run.cancel();
                        Err(e.context(format!(
                            "failed to build layer for {} file {}",
                            name,
                            path.display()
                        )))
                    }
                }
            });
        }

        let mut descriptors = Vec::with_capacity(paths.len());
        let mut first_error: Option<PackError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| PackError::Other(format!("layer task failed: {}", e)));
            match result.and_then(|r| r) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => {
                    run.cancel();
                    let replace = match &first_error {
                        None => true,
                        Some(existing) => {
                            matches!(existing, PackError::Cancelled)
                                && !matches!(e, PackError::Cancelled)
                        }
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        descriptors.sort_by(|a, b| a.filepath().cmp(b.filepath()));
        tracing::info!(processor = %self.name, count = descriptors.len(), "Processed files");
        Ok(descriptors)
    }
}
