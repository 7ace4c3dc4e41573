//! Build spec document.
//!
//! A YAML file naming the model and listing, per artifact category, the
//! files (or glob patterns) that go into it:
//!
//! ```yaml
//! name: qwen2
//! arch: transformer
//! family: qwen
//! format: safetensors
//! paramsize: 0.5B
//! config: [config.json, generation_config.json]
//! model: ["*.safetensors"]
//! code: ["*.py"]
//! doc: [README.md, LICENSE]
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use modpack_core::error::{PackError, Result};
use serde::Deserialize;

use crate::spec::{LayerCategory, ModelConfig, ModelDescriptor, ModelSpecConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSpec {
    pub name: String,
    pub arch: String,
    pub family: String,
    pub format: String,
    pub paramsize: String,
    pub precision: String,
    pub quantization: String,
    /// Fixed creation time; derived from file mtimes when absent
    pub created: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
    pub source_revision: Option<String>,

    pub config: Vec<String>,
    pub model: Vec<String>,
    pub code: Vec<String>,
    pub dataset: Vec<String>,
    pub doc: Vec<String>,

    /// Document text as read
    #[serde(skip)]
    pub raw: String,
}

impl BuildSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let mut spec: BuildSpec = serde_yaml::from_str(text)
            .map_err(|e| PackError::InvalidInput(format!("Failed to parse build spec: {}", e)))?;
        spec.raw = text.to_string();
        if spec.patterns_total() == 0 {
            return Err(PackError::InvalidInput(
                "build spec does not list any files".to_string(),
            ));
        }
        Ok(spec)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PackError::InvalidInput(format!(
                "Failed to read build spec {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    /// Patterns listed for a layer category.
    pub fn patterns(&self, category: LayerCategory) -> &[String] {
        match category {
            LayerCategory::Config => &self.config,
            LayerCategory::Weight => &self.model,
            LayerCategory::Code => &self.code,
            LayerCategory::Dataset => &self.dataset,
            LayerCategory::Doc => &self.doc,
        }
    }

    fn patterns_total(&self) -> usize {
        LayerCategory::ALL
            .iter()
            .map(|c| self.patterns(*c).len())
            .sum()
    }

    /// Model config carried in the config blob. Layer digests are filled
    /// in by the builder.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            descriptor: ModelDescriptor {
                created_at: self.created,
                family: self.family.clone(),
                name: self.name.clone(),
                source_url: self.source_url.clone().unwrap_or_default(),
                revision: self.source_revision.clone().unwrap_or_default(),
            },
            config: ModelSpecConfig {
                architecture: self.arch.clone(),
                format: self.format.clone(),
                param_size: self.paramsize.clone(),
                precision: self.precision.clone(),
                quantization: self.quantization.clone(),
            },
            ..Default::default()
        }
    }
}
