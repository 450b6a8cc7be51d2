//! Image reference parsing.
//!
//! References always carry the protocol the registry speaks, e.g.
//! `https://registry.example.org/library/redis:6@sha256:abc...`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThinError};

/// Tag used when a reference names neither a tag nor a digest.
const DEFAULT_TAG: &str = "latest";

/// Parsed `scheme://registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// `http` or `https`
    pub scheme: String,
    /// Registry host, possibly with a port
    pub registry: String,
    /// Repository path (e.g. "library/redis")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest including algorithm (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |why: &str| ThinError::InvalidReference(format!("{}: {}", why, reference));

        let (scheme, rest) = reference
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let (registry, path) = rest.split_once('/').unwrap_or((rest, ""));
        if registry.is_empty() {
            return Err(invalid("impossible to identify the registry"));
        }

        let mut at_parts = path.split('@');
        let name_tag = at_parts.next().unwrap_or_default();
        let digest = at_parts.next().map(str::to_string);
        if at_parts.next().is_some() {
            return Err(invalid("too many '@'"));
        }
        if let Some(d) = &digest {
            if !d.contains(':') {
                return Err(invalid("digest must be algorithm:hex"));
            }
        }

        // A tag is only recognised after the last path separator.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (repository, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        let repository = repository.trim_matches('/');
        if repository.is_empty() {
            return Err(invalid("impossible to find the repository"));
        }
        if repository.contains(':') {
            return Err(invalid("too many ':'"));
        }
        if matches!(tag.as_deref(), Some("")) {
            return Err(invalid("empty tag"));
        }

        Ok(ImageRef {
            scheme: scheme.to_string(),
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// `registry/repository[:tag]`
    pub fn simple_name(&self) -> String {
        let mut name = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            name.push(':');
            name.push_str(tag);
        }
        name
    }

    /// Full name including scheme and digest.
    pub fn whole_name(&self) -> String {
        let mut name = format!("{}://{}", self.scheme, self.simple_name());
        if let Some(digest) = &self.digest {
            name.push('@');
            name.push_str(digest);
        }
        name
    }

    /// Reference in the form registry clients expect (`registry/repo[:tag][@digest]`),
    /// defaulting the tag to `latest` when nothing pins the image.
    pub fn oci_reference(&self) -> String {
        let mut name = format!("{}/{}", self.registry, self.repository);
        match (&self.tag, &self.digest) {
            (Some(tag), _) => {
                name.push(':');
                name.push_str(tag);
            }
            (None, None) => {
                name.push(':');
                name.push_str(DEFAULT_TAG);
            }
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            name.push('@');
            name.push_str(digest);
        }
        name
    }

    /// Whether the registry should be contacted over plain HTTP.
    pub fn is_insecure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("http")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole_name())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = ThinError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repository_only() {
        let r = ImageRef::parse("https://registry.example.org/library/redis").unwrap();
        assert_eq!(r.scheme, "https");
        assert_eq!(r.registry, "registry.example.org");
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_with_tag() {
        let r = ImageRef::parse("https://reg/repo:v1").unwrap();
        assert_eq!(r.registry, "reg");
        assert_eq!(r.repository, "repo");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_parse_with_digest() {
        let r = ImageRef::parse("https://reg/org/repo@sha256:abc123").unwrap();
        assert_eq!(r.repository, "org/repo");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
    }

    #[test]
    fn test_parse_with_tag_and_digest() {
        let r = ImageRef::parse("https://reg/org/repo:v2@sha256:abc123").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v2"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageRef::parse("http://localhost:5000/thin/redis:1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "thin/redis");
        assert_eq!(r.tag.as_deref(), Some("1"));
        assert!(r.is_insecure());
    }

    #[test]
    fn test_parse_trailing_slash() {
        let r = ImageRef::parse("https://reg/repo/").unwrap();
        assert_eq!(r.repository, "repo");
    }

    #[test]
    fn test_parse_missing_scheme() {
        assert!(matches!(
            ImageRef::parse("reg/repo:v1"),
            Err(ThinError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_parse_missing_registry() {
        assert!(ImageRef::parse("https:///repo").is_err());
    }

    #[test]
    fn test_parse_missing_repository() {
        assert!(ImageRef::parse("https://reg").is_err());
        assert!(ImageRef::parse("https://reg/").is_err());
    }

    #[test]
    fn test_parse_too_many_at() {
        assert!(ImageRef::parse("https://reg/repo@sha256:a@sha256:b").is_err());
    }

    #[test]
    fn test_parse_bad_digest() {
        assert!(ImageRef::parse("https://reg/repo@abc").is_err());
    }

    #[test]
    fn test_whole_name_roundtrip() {
        let input = "https://reg/org/repo:v2@sha256:abc123";
        let r = ImageRef::parse(input).unwrap();
        assert_eq!(r.whole_name(), input);
        assert_eq!(r.to_string(), input);
        assert_eq!(ImageRef::parse(&r.whole_name()).unwrap(), r);
    }

    #[test]
    fn test_simple_name() {
        let r = ImageRef::parse("https://reg/repo:v1").unwrap();
        assert_eq!(r.simple_name(), "reg/repo:v1");
    }

    #[test]
    fn test_oci_reference_defaults_tag() {
        let r = ImageRef::parse("https://reg/repo").unwrap();
        assert_eq!(r.oci_reference(), "reg/repo:latest");
        let r = ImageRef::parse("https://reg/repo@sha256:abc").unwrap();
        assert_eq!(r.oci_reference(), "reg/repo@sha256:abc");
    }
}
