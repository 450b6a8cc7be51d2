//! Registry v2 / OCI image manifest model.

use serde::{Deserialize, Serialize};

/// Content descriptor (config blob or layer blob).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    pub digest: String,
}

/// Image manifest as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

fn default_schema_version() -> u32 {
    2
}

impl ImageManifest {
    /// Digest of the image config, the identity of the image content.
    pub fn config_digest(&self) -> &str {
        &self.config.digest
    }

    /// Layer digests in manifest order, without the hash scheme prefix.
    pub fn layer_digests_hex(&self) -> Vec<String> {
        self.layers
            .iter()
            .map(|l| strip_digest_scheme(&l.digest).to_string())
            .collect()
    }
}

/// `sha256:abc` -> `abc`. A digest without a scheme is returned unchanged.
pub fn strip_digest_scheme(digest: &str) -> &str {
    match digest.split_once(':') {
        Some((_, hex)) => hex,
        None => digest,
    }
}

/// Subset of the image configuration blob that conversion carries over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

/// Runtime defaults of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

impl ImageConfig {
    pub fn env(&self) -> &[String] {
        self.config
            .as_ref()
            .and_then(|c| c.env.as_deref())
            .unwrap_or_default()
    }

    pub fn cmd(&self) -> &[String] {
        self.config
            .as_ref()
            .and_then(|c| c.cmd.as_deref())
            .unwrap_or_default()
    }
}
