//! Mark-and-sweep garbage collection over a content store.
//!
//! Every manifest listed in a repository's index marks itself, its config
//! and its layers reachable; every other blob in the repository is swept.
//! A repository with blobs but no index has nothing reachable, so all of its
//! blobs are swept. A repository whose index or manifests cannot be read is
//! skipped and reported, leaving its blobs untouched.

use std::collections::HashSet;

use modpack_core::error::{PackError, Result};

use super::Storage;
use crate::spec::{Index, Manifest};

/// Outcome of a prune over the whole store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Pruned (or, in a dry run, prunable) blobs as `repo@digest`
    pub pruned: Vec<String>,
    /// Repositories skipped because of an error, with the error message
    pub failed: Vec<(String, String)>,
}

/// Prune every repository in `store`.
pub async fn prune<S: Storage + ?Sized>(
    store: &S,
    dry_run: bool,
    remove_untagged: bool,
) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    for repo in store.list_repositories().await? {
        match prune_repo(store, &repo, dry_run, remove_untagged).await {
            Ok(pruned) => report.pruned.extend(pruned),
            Err(e) => {
                tracing::warn!(repo = %repo, error = %e, "Skipping repository during prune");
                report.failed.push((repo, e.to_string()));
            }
        }
    }

    tracing::info!(
        pruned = report.pruned.len(),
        failed = report.failed.len(),
        dry_run,
        "Prune finished"
    );
    Ok(report)
}

/// Prune one repository, returning the swept blobs as `repo@digest`.
///
/// With `remove_untagged`, manifests that no tag points at are deleted first
/// and do not mark anything reachable. The repository itself is never
/// removed.
pub async fn prune_repo<S: Storage + ?Sized>(
    store: &S,
    repo: &str,
    dry_run: bool,
    remove_untagged: bool,
) -> Result<Vec<String>> {
    let index = match store.get_index(repo).await {
        Ok(index) => index,
        Err(PackError::NotFound(_)) => Index::default(),
        Err(e) => return Err(e),
    };
    let tagged: HashSet<&str> = index
        .manifests
        .iter()
        .filter(|d| Index::tag_of(d).is_some())
        .map(|d| d.digest.as_str())
        .collect();

    let mut reachable = HashSet::new();
    let mut untagged = Vec::new();
    for entry in &index.manifests {
        if remove_untagged && !tagged.contains(entry.digest.as_str()) {
            if !untagged.contains(&entry.digest) {
                untagged.push(entry.digest.clone());
            }
            continue;
        }
        let (body, _) = store
            .pull_manifest(repo, &entry.digest)
            .await
            .map_err(|e| e.context(format!("failed to pull manifest {}", entry.digest)))?;
        let manifest = Manifest::from_slice(&body)
            .map_err(|e| e.context(format!("manifest {}", entry.digest)))?;
        reachable.insert(entry.digest.clone());
        reachable.extend(manifest.referenced_digests().map(str::to_string));
    }

    let all_blobs = store.list_blobs(repo).await?;

    if !dry_run {
        for digest in &untagged {
            store.delete_manifest(repo, digest).await?;
            tracing::debug!(repo, digest = %digest, "Deleted untagged manifest");
        }
    }

    let prune_set: HashSet<String> = all_blobs
        .into_iter()
        .filter(|d| !reachable.contains(d))
        .collect();

    if !dry_run && !prune_set.is_empty() {
        store.cleanup_repo(repo, &prune_set, false).await?;
    }

    let mut pruned: Vec<String> = prune_set
        .into_iter()
        .map(|d| format!("{}@{}", repo, d))
        .collect();
    pruned.sort();
    Ok(pruned)
}
