//! Model artifact reference parsing.
//!
//! Parses references like `registry.example.com/org/qwen:v1` into registry,
//! repository and tag or digest. Content stores key repositories by
//! `<registry>/<repository>`, so the same reference names the same artifact
//! locally and remotely.

use modpack_core::error::{PackError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed model artifact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    /// Registry hostname, optionally with port
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Tag
    pub tag: Option<String>,
    /// Digest (`sha256:<hex>`)
    pub digest: Option<String>,
}

impl ModelReference {
    /// Parse a reference string.
    ///
    /// - `qwen` → docker.io/library/qwen:latest
    /// - `org/qwen:v1` → docker.io/org/qwen:v1
    /// - `localhost:5000/qwen` → localhost:5000/qwen:latest
    /// - `reg.io/org/qwen@sha256:...` → digest reference, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PackError::InvalidInput("Empty model reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(PackError::InvalidInput(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry_repository(name)?;

        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(PackError::InvalidInput(format!(
                    "Empty tag in reference '{}'",
                    reference
                )));
            }
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Content store repository key: `<registry>/<repository>`.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The digest if present, else the tag.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Tag, falling back to the default tag.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repo();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ModelReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`, where the tag colon must follow the last slash and a
/// bare numeric suffix on a single component is a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last..].rfind(':') {
        Some(colon) => {
            let split = last + colon;
            let after = &name_tag[split + 1..];
            if last == 0 && !after.is_empty() && after.chars().all(|c| c.is_ascii_digit()) {
                (name_tag, None)
            } else {
                (&name_tag[..split], Some(after.to_string()))
            }
        }
        None => (name_tag, None),
    }
}

/// A first component containing a dot or colon, or equal to `localhost`, is a
/// registry host.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(PackError::InvalidInput(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err(PackError::InvalidInput(
            "Empty repository in reference".to_string(),
        ));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ModelReference::parse("qwen").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/qwen");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_custom_registry_with_tag() {
        let r = ModelReference::parse("reg.example.com/org/qwen:v1").unwrap();
        assert_eq!(r.registry, "reg.example.com");
        assert_eq!(r.repository, "org/qwen");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.repo(), "reg.example.com/org/qwen");
        assert_eq!(r.reference(), "v1");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ModelReference::parse("localhost:5000/qwen:v2").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "qwen");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_port_without_repository_path() {
        let r = ModelReference::parse("localhost:5000").unwrap();
        assert_eq!(r.repository, "library/localhost:5000");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ModelReference::parse("reg.io/org/qwen@sha256:abcdef").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef"));
        assert_eq!(r.reference(), "sha256:abcdef");
        assert_eq!(r.tag_or_default(), "latest");
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ModelReference::parse("reg.io/org/qwen:v1@sha256:abcdef").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.full_reference(), "reg.io/org/qwen:v1@sha256:abcdef");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ModelReference::parse("").is_err());
        assert!(ModelReference::parse("qwen@nodigest").is_err());
        assert!(ModelReference::parse("reg.io/").is_err());
        assert!(ModelReference::parse("reg.io/qwen:").is_err());
    }

    #[test]
    fn test_display() {
        let r = ModelReference::parse("  org/qwen:v1 ").unwrap();
        assert_eq!(r.to_string(), "docker.io/org/qwen:v1");
    }
}
