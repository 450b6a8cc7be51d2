//! Thin image descriptor.
//!
//! A thin image is a regular image whose only layer carries a small JSON
//! file, [`THIN_MARKER`], listing where the real layers live in the
//! distributed store. The presence of that file in a layer diff directory is
//! what marks the layer as thin.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThinError};
use crate::manifest::{strip_digest_scheme, ImageManifest};

/// Marker file name inside a layer diff directory.
pub const THIN_MARKER: &str = "thin.json";

/// Descriptor format version written by this crate.
pub const THIN_VERSION: &str = "1.0";

/// URL scheme of store locators.
const STORE_SCHEME: &str = "cvmfs";

/// Where a layer lives: a store repository plus a path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreLocator {
    pub repo: String,
    pub path: String,
}

impl StoreLocator {
    pub fn new(repo: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into().trim_matches('/').to_string(),
        }
    }

    /// Parse `cvmfs://<repo>/<path>`.
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            ThinError::SerializationError(format!("layer url without scheme: {}", url))
        })?;
        if scheme != STORE_SCHEME {
            return Err(ThinError::SerializationError(format!(
                "unsupported layer url scheme '{}': {}",
                scheme, url
            )));
        }
        let (repo, path) = rest.split_once('/').unwrap_or((rest, ""));
        if repo.is_empty() {
            return Err(ThinError::SerializationError(format!(
                "layer url without repository: {}",
                url
            )));
        }
        Ok(Self::new(repo, path))
    }

    pub fn url(&self) -> String {
        format!("{}://{}/{}", STORE_SCHEME, self.repo, self.path)
    }

    /// `<repo>/<path>`, the path relative to the store mount root.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.repo, self.path)
    }
}

impl fmt::Display for StoreLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// One externalised layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawThinLayer", into = "RawThinLayer")]
pub struct ThinLayer {
    /// Content digest without the hash scheme prefix
    pub digest: String,
    pub locator: StoreLocator,
}

/// Wire shape of a layer. Older descriptors carry `repo` + `location`
/// instead of `url`.
#[derive(Serialize, Deserialize)]
struct RawThinLayer {
    digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

impl TryFrom<RawThinLayer> for ThinLayer {
    type Error = ThinError;

    fn try_from(raw: RawThinLayer) -> Result<Self> {
        let locator = match (raw.url, raw.repo) {
            (Some(url), _) => StoreLocator::from_url(&url)?,
            (None, Some(repo)) => {
                let location = raw.location.unwrap_or_default();
                let location = location.trim_matches('/');
                let path = if location.is_empty() {
                    raw.digest.clone()
                } else if location.ends_with(raw.digest.as_str()) {
                    location.to_string()
                } else {
                    format!("{}/{}", location, raw.digest)
                };
                StoreLocator::new(repo, path)
            }
            (None, None) => {
                return Err(ThinError::SerializationError(format!(
                    "layer {} has no store location",
                    raw.digest
                )))
            }
        };
        Ok(ThinLayer {
            digest: raw.digest,
            locator,
        })
    }
}

impl From<ThinLayer> for RawThinLayer {
    fn from(layer: ThinLayer) -> Self {
        RawThinLayer {
            url: Some(layer.locator.url()),
            digest: layer.digest,
            repo: None,
            location: None,
        }
    }
}

/// Thin image descriptor.
///
/// `layers` is kept in store order, base layer first, the same order as the
/// source manifest. Union mounts want the opposite order, see
/// [`ThinImage::layers_top_down`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinImage {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub layers: Vec<ThinLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ThinImage {
    /// Build a descriptor from a source manifest.
    ///
    /// `location` is `<repo>/<subdir>`, the place the layers were ingested
    /// to; each layer ends up at `<location>/<hex digest>`.
    pub fn from_manifest(manifest: &ImageManifest, location: &str, origin: &str) -> Self {
        let location = location.trim_matches('/');
        let (repo, subdir) = location.split_once('/').unwrap_or((location, ""));
        let layers = manifest
            .layers
            .iter()
            .map(|l| {
                let digest = strip_digest_scheme(&l.digest).to_string();
                let path = if subdir.is_empty() {
                    digest.clone()
                } else {
                    format!("{}/{}", subdir, digest)
                };
                ThinLayer {
                    locator: StoreLocator::new(repo, path),
                    digest,
                }
            })
            .collect();

        ThinImage {
            version: THIN_VERSION.to_string(),
            min_version: None,
            origin: if origin.is_empty() {
                None
            } else {
                Some(origin.to_string())
            },
            layers,
            comment: None,
        }
    }

    /// Layers newest first, the order overlay `lowerdir` expects.
    pub fn layers_top_down(&self) -> impl Iterator<Item = &ThinLayer> {
        self.layers.iter().rev()
    }

    /// Add a new topmost layer.
    pub fn push_layer(&mut self, layer: ThinLayer) {
        self.layers.push(layer);
    }

    /// Distinct repositories referenced, in first-seen order.
    pub fn repos(&self) -> Vec<String> {
        let mut repos: Vec<String> = Vec::new();
        for layer in &self.layers {
            if !repos.iter().any(|r| *r == layer.locator.repo) {
                repos.push(layer.locator.repo.clone());
            }
        }
        repos
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Whether `dir` carries the thin marker.
    pub fn is_thin_dir(dir: &Path) -> bool {
        dir.join(THIN_MARKER).is_file()
    }

    /// Read the marker of `dir`, `None` if the directory is not thin.
    pub fn read_from_dir(dir: &Path) -> Result<Option<Self>> {
        let marker = dir.join(THIN_MARKER);
        match std::fs::read(&marker) {
            Ok(bytes) => Ok(Some(Self::from_json(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ThinError::IoError(std::io::Error::new(
                e.kind(),
                format!("failed to read {}: {}", marker.display(), e),
            ))),
        }
    }

    /// Write the marker into `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(THIN_MARKER), self.to_json()?)?;
        Ok(())
    }
}
