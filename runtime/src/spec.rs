//! Model artifact data model.
//!
//! Serde mirrors of the OCI descriptor, manifest and index documents plus the
//! model config blob and the per-file metadata annotation. Annotation maps are
//! `BTreeMap`s so serialized JSON is canonical and digests are reproducible.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use modpack_core::error::{PackError, Result};

/// OCI image manifest media type.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index media type.
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Artifact type of a model manifest.
pub const ARTIFACT_TYPE_MODEL_MANIFEST: &str = "application/vnd.cnai.model.manifest.v1+json";
/// Media type of the model config blob.
pub const MEDIA_TYPE_MODEL_CONFIG: &str = "application/vnd.cnai.model.config.v1+json";

pub const MEDIA_TYPE_WEIGHT_CONFIG_RAW: &str = "application/vnd.cnai.model.weight.config.v1.raw";
pub const MEDIA_TYPE_WEIGHT_CONFIG_TAR: &str = "application/vnd.cnai.model.weight.config.v1.tar";
pub const MEDIA_TYPE_WEIGHT_RAW: &str = "application/vnd.cnai.model.weight.v1.raw";
pub const MEDIA_TYPE_WEIGHT_TAR: &str = "application/vnd.cnai.model.weight.v1.tar";
pub const MEDIA_TYPE_CODE_RAW: &str = "application/vnd.cnai.model.code.v1.raw";
pub const MEDIA_TYPE_CODE_TAR: &str = "application/vnd.cnai.model.code.v1.tar";
pub const MEDIA_TYPE_DATASET_RAW: &str = "application/vnd.cnai.model.dataset.v1.raw";
pub const MEDIA_TYPE_DATASET_TAR: &str = "application/vnd.cnai.model.dataset.v1.tar";
pub const MEDIA_TYPE_DOC_RAW: &str = "application/vnd.cnai.model.doc.v1.raw";
pub const MEDIA_TYPE_DOC_TAR: &str = "application/vnd.cnai.model.doc.v1.tar";

/// Relative path of the file carried by a layer.
pub const ANNOTATION_FILEPATH: &str = "org.cnai.model.filepath";
/// JSON-encoded [`FileMetadata`] of the file carried by a layer.
pub const ANNOTATION_FILE_METADATA: &str = "org.cnai.model.file.metadata+json";
/// Per-chunk CRC32C checksums computed by the chunk interceptor.
pub const ANNOTATION_NYDUS_CRCS: &str = "org.cnai.nydus.crcs";
/// Manifest creation time (RFC 3339).
pub const ANNOTATION_CREATED: &str = "org.cnai.model.created";
/// Build-spec document the artifact was produced from.
pub const ANNOTATION_BUILDSPEC: &str = "org.cnai.model.buildspec";
/// Tag name on an `index.json` entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Artifact category, in manifest layer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerCategory {
    Config,
    Weight,
    Code,
    Dataset,
    Doc,
}

impl LayerCategory {
    /// Every category, in manifest layer order.
    pub const ALL: [LayerCategory; 5] = [
        LayerCategory::Config,
        LayerCategory::Weight,
        LayerCategory::Code,
        LayerCategory::Dataset,
        LayerCategory::Doc,
    ];

    /// Layer media type of this category for the raw or tar codec.
    pub fn media_type(&self, raw: bool) -> &'static str {
        match (self, raw) {
            (LayerCategory::Config, true) => MEDIA_TYPE_WEIGHT_CONFIG_RAW,
            (LayerCategory::Config, false) => MEDIA_TYPE_WEIGHT_CONFIG_TAR,
            (LayerCategory::Weight, true) => MEDIA_TYPE_WEIGHT_RAW,
            (LayerCategory::Weight, false) => MEDIA_TYPE_WEIGHT_TAR,
            (LayerCategory::Code, true) => MEDIA_TYPE_CODE_RAW,
            (LayerCategory::Code, false) => MEDIA_TYPE_CODE_TAR,
            (LayerCategory::Dataset, true) => MEDIA_TYPE_DATASET_RAW,
            (LayerCategory::Dataset, false) => MEDIA_TYPE_DATASET_TAR,
            (LayerCategory::Doc, true) => MEDIA_TYPE_DOC_RAW,
            (LayerCategory::Doc, false) => MEDIA_TYPE_DOC_TAR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayerCategory::Config => "config",
            LayerCategory::Weight => "model",
            LayerCategory::Code => "code",
            LayerCategory::Dataset => "dataset",
            LayerCategory::Doc => "doc",
        }
    }

    /// Category of a layer media type in either encoding.
    pub fn from_media_type(media_type: &str) -> Option<LayerCategory> {
        Self::ALL
            .into_iter()
            .find(|c| c.media_type(true) == media_type || c.media_type(false) == media_type)
    }

    /// Category a file belongs to by its name, matched case-insensitively.
    /// Datasets are never inferred.
    pub fn for_file(path: &str) -> Option<LayerCategory> {
        let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
        let options = glob::MatchOptions {
            case_sensitive: false,
            ..Default::default()
        };
        [
            (LayerCategory::Config, CONFIG_FILE_PATTERNS),
            (LayerCategory::Weight, WEIGHT_FILE_PATTERNS),
            (LayerCategory::Code, CODE_FILE_PATTERNS),
            (LayerCategory::Doc, DOC_FILE_PATTERNS),
        ]
        .into_iter()
        .find(|(_, patterns)| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|p| p.matches_with(&name, options))
                    .unwrap_or(false)
            })
        })
        .map(|(category, _)| category)
    }
}

const CONFIG_FILE_PATTERNS: &[&str] = &[
    "*.json", "*.jsonl", "*.json5", "*.jsonc", "*.yaml", "*.yml", "*.toml", "*.ini", "*.cfg",
    "*.conf", "*.config", "*.xml", "*.meta", "*.params", "*.hparams", "*tokenizer.model*",
    "config.json.*",
];

const WEIGHT_FILE_PATTERNS: &[&str] = &[
    "*.safetensors", "*.bin", "*.pt", "*.pth", "*.ckpt", "*.gguf", "*.ggml", "*.onnx", "*.h5",
    "*.keras", "*.pb", "*.tflite", "*.msgpack", "*.npz", "*.npy", "*.pkl", "*.model", "*.engine",
    "*.mlmodel",
];

const CODE_FILE_PATTERNS: &[&str] = &[
    "*.py", "*.ipynb", "*.sh", "*.bash", "*.c", "*.cc", "*.cpp", "*.h", "*.hpp", "*.cu", "*.rs",
    "*.go", "*.java", "*.js", "*.ts", "*.lua", "*.r", "*.jl", "*.swift", "*.proto", "*.sql",
];

const DOC_FILE_PATTERNS: &[&str] = &[
    "*.md", "*.markdown", "*.txt", "*.rst", "*.pdf", "*.html", "*.htm", "*.tex", "*.adoc",
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "license*", "readme*", "notice*", "authors*",
    "changelog*",
];

/// Content-addressed reference to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// Value of the filepath annotation, or "" when absent.
    pub fn filepath(&self) -> &str {
        self.annotations
            .get(ANNOTATION_FILEPATH)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Copy carrying only media type, digest and size.
    pub fn stripped(&self) -> Self {
        Self::new(self.media_type.clone(), self.digest.clone(), self.size)
    }

    /// Decoded file-metadata annotation, if present and well-formed.
    pub fn file_metadata(&self) -> Option<FileMetadata> {
        self.annotations
            .get(ANNOTATION_FILE_METADATA)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Model manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default = "default_manifest_media_type")]
    pub media_type: String,
    #[serde(
        rename = "artifactType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn default_manifest_media_type() -> String {
    MEDIA_TYPE_MANIFEST.to_string()
}

impl Manifest {
    /// Model manifest over a config and ordered layers.
    pub fn new(
        config: Descriptor,
        layers: Vec<Descriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            artifact_type: Some(ARTIFACT_TYPE_MODEL_MANIFEST.to_string()),
            config: config.stripped(),
            layers,
            annotations,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            PackError::SerializationError(format!("Failed to parse manifest: {}", e))
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Every blob digest this manifest references, config first.
    pub fn referenced_digests(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.config.digest.as_str())
            .chain(self.layers.iter().map(|l| l.digest.as_str()))
    }

    /// Manifest bytes plus config and layer sizes.
    pub fn total_size(&self, manifest_len: u64) -> u64 {
        manifest_len + self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

/// Per-repository index of manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }
}

impl Index {
    /// Tag name of an index entry.
    pub fn tag_of(desc: &Descriptor) -> Option<&str> {
        desc.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }

    /// Digest bound to `tag`, if any.
    pub fn resolve_tag(&self, tag: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| Self::tag_of(d) == Some(tag))
    }

    /// Tag names in index order.
    pub fn tags(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|d| Self::tag_of(d).map(str::to_string))
            .collect()
    }
}

/// Model config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub descriptor: ModelDescriptor,
    pub modelfs: ModelFs,
    pub config: ModelSpecConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpecConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(rename = "paramSize", default, skip_serializing_if = "String::is_empty")]
    pub param_size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub precision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quantization: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "sourceURL", default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(rename = "diffIds", alias = "diff_ids", default, deserialize_with = "null_as_empty")]
    pub diff_ids: Vec<String>,
}

impl Default for ModelFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Typeflag of a regular file.
pub const TYPEFLAG_REG: u8 = 0;
/// Typeflag of a symlink.
pub const TYPEFLAG_SYMLINK: u8 = 2;
/// Typeflag of a directory.
pub const TYPEFLAG_DIR: u8 = 5;

/// File-system metadata of the file carried by a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub typeflag: u8,
}

impl FileMetadata {
    /// Metadata of the file at `path`, named `name`.
    pub fn from_path(path: &std::path::Path, name: &str) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| {
            PackError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to stat {}: {}", path.display(), e),
            ))
        })?;
        Ok(Self::from_metadata(&meta, name))
    }

    pub fn from_metadata(meta: &std::fs::Metadata, name: &str) -> Self {
        use std::os::unix::fs::MetadataExt;

        let typeflag = if meta.file_type().is_symlink() {
            TYPEFLAG_SYMLINK
        } else if meta.is_dir() {
            TYPEFLAG_DIR
        } else {
            TYPEFLAG_REG
        };
        let mtime = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Self {
            name: name.to_string(),
            mode: meta.mode() & 0o777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            mtime,
            typeflag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(path: &str) -> Descriptor {
        let mut d = Descriptor::new(MEDIA_TYPE_WEIGHT_RAW, "sha256:aa", 10);
        d.annotations
            .insert(ANNOTATION_FILEPATH.to_string(), path.to_string());
        d
    }

    #[test]
    fn test_category_for_file() {
        assert_eq!(LayerCategory::for_file("config.json"), Some(LayerCategory::Config));
        assert_eq!(LayerCategory::for_file("tokenizer.model"), Some(LayerCategory::Config));
        assert_eq!(LayerCategory::for_file("weights/Model-00001.SafeTensors"), Some(LayerCategory::Weight));
        assert_eq!(LayerCategory::for_file("src/train.py"), Some(LayerCategory::Code));
        assert_eq!(LayerCategory::for_file("LICENSE"), Some(LayerCategory::Doc));
        assert_eq!(LayerCategory::for_file("data.unknownext"), None);
    }

    #[test]
    fn test_category_from_media_type() {
        assert_eq!(LayerCategory::from_media_type(MEDIA_TYPE_CODE_TAR), Some(LayerCategory::Code));
        assert_eq!(LayerCategory::from_media_type(MEDIA_TYPE_WEIGHT_RAW), Some(LayerCategory::Weight));
        assert_eq!(LayerCategory::from_media_type(MEDIA_TYPE_MODEL_CONFIG), None);
    }

    #[test]
    fn test_descriptor_omits_empty_annotations() {
        let d = Descriptor::new(MEDIA_TYPE_MODEL_CONFIG, "sha256:ab", 3);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(
            json,
            r#"{"mediaType":"application/vnd.cnai.model.config.v1+json","digest":"sha256:ab","size":3}"#
        );
    }

    #[test]
    fn test_annotations_serialize_sorted() {
        let mut d = layer("model.bin");
        d.annotations.insert("a.first".into(), "1".into());
        let json = serde_json::to_string(&d).unwrap();
        let a = json.find("a.first").unwrap();
        let b = json.find(ANNOTATION_FILEPATH).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_manifest_strips_config_annotations() {
        let mut config = Descriptor::new(MEDIA_TYPE_MODEL_CONFIG, "sha256:cc", 5);
        config.annotations.insert("x".into(), "y".into());
        let m = Manifest::new(config, vec![layer("a")], BTreeMap::new());
        assert!(m.config.annotations.is_empty());
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.artifact_type.as_deref(), Some(ARTIFACT_TYPE_MODEL_MANIFEST));
    }

    #[test]
    fn test_manifest_roundtrip_is_canonical() {
        let m = Manifest::new(
            Descriptor::new(MEDIA_TYPE_MODEL_CONFIG, "sha256:cc", 5),
            vec![layer("a"), layer("b")],
            BTreeMap::from([(ANNOTATION_CREATED.to_string(), "1970-01-01T00:00:00Z".to_string())]),
        );
        let bytes = m.to_vec().unwrap();
        let parsed = Manifest::from_slice(&bytes).unwrap();
        assert_eq!(parsed.to_vec().unwrap(), bytes);
        assert_eq!(parsed.referenced_digests().count(), 3);
        assert_eq!(parsed.total_size(100), 125);
    }

    #[test]
    fn test_manifest_parse_error_is_serialization_error() {
        let err = Manifest::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, PackError::SerializationError(_)));
    }

    #[test]
    fn test_model_config_omits_empty_fields() {
        let cfg = ModelConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["modelfs"]["type"], "layers");
        assert!(json["config"].as_object().unwrap().is_empty());
        assert!(json["descriptor"].get("createdAt").is_none());
    }

    #[test]
    fn test_model_config_accepts_null_diff_ids() {
        let raw = r#"{
            "descriptor": {"createdAt": "2025-02-12T17:01:43.968027+08:00", "family": "qwen2", "name": "Qwen2.5-0.5B"},
            "modelfs": {"type": "layers", "diff_ids": null},
            "config": {"architecture": "transformer", "paramSize": "0.5b"}
        }"#;
        let cfg: ModelConfig = serde_json::from_str(raw).unwrap();
        assert!(cfg.modelfs.diff_ids.is_empty());
        assert_eq!(cfg.config.param_size, "0.5b");
        assert_eq!(cfg.descriptor.family, "qwen2");
    }

    #[test]
    fn test_index_resolve_tag() {
        let mut entry = Descriptor::new(MEDIA_TYPE_MANIFEST, "sha256:dd", 1);
        entry
            .annotations
            .insert(ANNOTATION_REF_NAME.into(), "v1".into());
        let index = Index {
            manifests: vec![entry, Descriptor::new(MEDIA_TYPE_MANIFEST, "sha256:ee", 1)],
            ..Default::default()
        };
        assert_eq!(index.resolve_tag("v1").unwrap().digest, "sha256:dd");
        assert!(index.resolve_tag("v2").is_none());
        assert_eq!(index.tags(), vec!["v1".to_string()]);
    }

    #[test]
    fn test_category_media_types() {
        assert_eq!(LayerCategory::Doc.media_type(false), MEDIA_TYPE_DOC_TAR);
        assert_eq!(LayerCategory::Weight.media_type(true), MEDIA_TYPE_WEIGHT_RAW);
        assert!(LayerCategory::Code < LayerCategory::Dataset);
        assert!(LayerCategory::Dataset < LayerCategory::Doc);
    }

    #[test]
    fn test_file_metadata_from_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, b"12345").unwrap();
        let meta = FileMetadata::from_path(&path, "f.txt").unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.typeflag, TYPEFLAG_REG);
        assert_eq!(meta.mode & !0o7777, 0);

        let dir = FileMetadata::from_path(tmp.path(), "d").unwrap();
        assert_eq!(dir.typeflag, TYPEFLAG_DIR);
    }
}
