//! `list` and `inspect`.

use chrono::{DateTime, SecondsFormat, Utc};
use modpack_core::error::{PackError, Result};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use super::Backend;
use crate::reference::ModelReference;
use crate::spec::{Descriptor, Manifest, ModelConfig, ANNOTATION_CREATED};
use crate::store::Storage;

/// One tagged artifact in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub repository: String,
    pub tag: String,
    pub digest: String,
    /// Manifest, config and layer bytes
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectedArtifact {
    #[serde(rename = "Id")]
    pub id: String,
    pub digest: String,
    pub architecture: String,
    pub created_at: String,
    pub family: String,
    pub format: String,
    pub name: String,
    pub param_size: String,
    pub precision: String,
    pub quantization: String,
    pub layers: Vec<InspectedLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectedLayer {
    pub digest: String,
    pub size: u64,
    pub filepath: String,
}

impl Backend {
    /// Every tagged artifact, newest first.
    pub async fn list(&self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for repo in self.store.list_repositories().await? {
            let tags = self
                .store
                .list_tags(&repo)
                .await
                .map_err(|e| e.context(format!("failed to list tags in repository {}", repo)))?;
            for tag in tags {
                artifacts.push(assemble(self.store.as_ref(), &repo, &tag).await?);
            }
        }

        artifacts.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| a.repository.cmp(&b.repository))
                .then_with(|| a.tag.cmp(&b.tag))
        });
        Ok(artifacts)
    }

    /// Describe an artifact from the local store, or from its registry with
    /// `remote`.
    pub async fn inspect(
        &self,
        target: &str,
        remote: bool,
        plain_http: bool,
        insecure: bool,
    ) -> Result<InspectedArtifact> {
        let reference = ModelReference::parse(target)
            .map_err(|e| e.context("failed to parse target"))?;
        let store = if remote {
            self.remote(&reference.registry, plain_http, insecure)?
        } else {
            self.store.clone()
        };
        let repo = reference.repo();

        let (body, digest) = store
            .pull_manifest(&repo, reference.reference())
            .await
            .map_err(|e| e.context("failed to get manifest"))?;
        let manifest = Manifest::from_slice(&body)?;

        let config = read_model_config(store.as_ref(), &repo, &manifest.config).await?;

        Ok(InspectedArtifact {
            id: manifest.config.digest.clone(),
            digest,
            architecture: config.config.architecture,
            created_at: config
                .descriptor
                .created_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            family: config.descriptor.family,
            format: config.config.format,
            name: config.descriptor.name,
            param_size: config.config.param_size,
            precision: config.config.precision,
            quantization: config.config.quantization,
            layers: manifest
                .layers
                .iter()
                .map(|l| InspectedLayer {
                    digest: l.digest.clone(),
                    size: l.size,
                    filepath: l.filepath().to_string(),
                })
                .collect(),
        })
    }
}

/// Fetch and parse the model config blob `desc` names.
pub(super) async fn read_model_config(
    store: &dyn Storage,
    repo: &str,
    desc: &Descriptor,
) -> Result<ModelConfig> {
    let mut raw = Vec::new();
    store
        .pull_blob(repo, &desc.digest)
        .await
        .map_err(|e| e.context("failed to get config"))?
        .read_to_end(&mut raw)
        .await?;
    serde_json::from_slice(&raw).map_err(|e| {
        PackError::SerializationError(format!("Failed to parse model config: {}", e))
    })
}

async fn assemble(store: &dyn Storage, repo: &str, tag: &str) -> Result<Artifact> {
    let (body, digest) = store
        .pull_manifest(repo, tag)
        .await
        .map_err(|e| e.context(format!("failed to pull manifest {}:{}", repo, tag)))?;
    let manifest = Manifest::from_slice(&body)?;

    let created = match manifest.annotations.get(ANNOTATION_CREATED) {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    PackError::SerializationError(format!("failed to parse created time: {}", e))
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    Ok(Artifact {
        repository: repo.to_string(),
        tag: tag.to_string(),
        digest,
        size: manifest.total_size(body.len() as u64),
        created,
    })
}
