//! Registry access for conversion.
//!
//! Uses the `oci-distribution` crate, which negotiates bearer tokens from the
//! registry's `WWW-Authenticate` challenge on its own.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use thinimage_core::error::{Result, ThinError};
use thinimage_core::{Descriptor, ImageConfig, ImageManifest, ImageRef};

/// Media type of the single-file layer carrying a thin descriptor.
pub const THIN_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type of the image config pushed with a thin image.
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Credentials for one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Manifest and config of a source image.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub manifest: ImageManifest,
    /// Digest of the manifest itself
    pub digest: String,
    pub config: ImageConfig,
}

/// Contents of a thin image ready to push.
#[derive(Debug, Clone)]
pub struct ThinPayload {
    /// Tarball holding only the thin descriptor
    pub layer: Vec<u8>,
    /// Image config JSON
    pub config: Vec<u8>,
}

/// Where source images come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_manifest(&self, reference: &ImageRef, auth: &RegistryAuth) -> Result<FetchedImage>;

    /// Download one blob to `dest`, returning the number of bytes written.
    async fn fetch_blob(
        &self,
        reference: &ImageRef,
        layer: &Descriptor,
        auth: &RegistryAuth,
        dest: &Path,
    ) -> Result<u64>;
}

/// Where thin images go.
#[async_trait]
pub trait ImagePublisher: Send + Sync {
    /// Push a thin image and return the manifest URL.
    async fn push_thin(
        &self,
        reference: &ImageRef,
        auth: &RegistryAuth,
        payload: &ThinPayload,
    ) -> Result<String>;
}

/// Registry client speaking the distribution API.
pub struct OciRegistry {
    https: Client,
    http: Client,
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OciRegistry {
    pub fn new() -> Self {
        Self {
            https: Client::new(client_config(ClientProtocol::Https)),
            http: Client::new(client_config(ClientProtocol::Http)),
        }
    }

    /// The protocol follows the reference scheme.
    fn client(&self, reference: &ImageRef) -> &Client {
        if reference.is_insecure() {
            &self.http
        } else {
            &self.https
        }
    }
}

fn client_config(protocol: ClientProtocol) -> ClientConfig {
    ClientConfig {
        protocol,
        platform_resolver: Some(Box::new(linux_platform_resolver)),
        ..Default::default()
    }
}

fn registry_error(reference: &ImageRef, message: String) -> ThinError {
    ThinError::Registry {
        registry: reference.registry.clone(),
        message,
    }
}

/// Convert an image reference into an oci-distribution reference.
pub fn to_oci_reference(reference: &ImageRef) -> Result<Reference> {
    let name = reference.oci_reference();
    name.parse::<Reference>()
        .map_err(|e| ThinError::InvalidReference(format!("{}: {}", name, e)))
}

#[async_trait]
impl ImageSource for OciRegistry {
    async fn fetch_manifest(&self, reference: &ImageRef, auth: &RegistryAuth) -> Result<FetchedImage> {
        let oci_ref = to_oci_reference(reference)?;
        tracing::debug!(reference = %reference, "Fetching manifest");

        let (oci_manifest, digest, config) = self
            .client(reference)
            .pull_manifest_and_config(&oci_ref, &auth.to_oci_auth())
            .await
            .map_err(|e| registry_error(reference, format!("Failed to pull manifest: {}", e)))?;

        let manifest: ImageManifest = serde_json::from_slice(&serde_json::to_vec(&oci_manifest)?)?;
        let config = match serde_json::from_str::<ImageConfig>(&config) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "Unreadable image config");
                ImageConfig::default()
            }
        };

        tracing::info!(
            reference = %reference,
            digest = %digest,
            layers = manifest.layers.len(),
            "Manifest fetched"
        );
        Ok(FetchedImage {
            manifest,
            digest,
            config,
        })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageRef,
        layer: &Descriptor,
        auth: &RegistryAuth,
        dest: &Path,
    ) -> Result<u64> {
        let oci_ref = to_oci_reference(reference)?;
        let client = self.client(reference);
        client
            .auth(&oci_ref, &auth.to_oci_auth(), RegistryOperation::Pull)
            .await
            .map_err(|e| registry_error(reference, format!("Authentication failed: {}", e)))?;

        let descriptor = OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: layer.size,
            urls: None,
            annotations: None,
        };
        let mut file = tokio::fs::File::create(dest).await?;
        client
            .pull_blob(&oci_ref, &descriptor, &mut file)
            .await
            .map_err(|e| {
                registry_error(reference, format!("Failed to pull layer {}: {}", layer.digest, e))
            })?;
        file.flush().await?;

        let size = tokio::fs::metadata(dest).await?.len();
        tracing::debug!(digest = %layer.digest, size, "Layer downloaded");
        Ok(size)
    }
}

#[async_trait]
impl ImagePublisher for OciRegistry {
    async fn push_thin(
        &self,
        reference: &ImageRef,
        auth: &RegistryAuth,
        payload: &ThinPayload,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        tracing::info!(reference = %reference, "Pushing thin image");

        let layers = vec![ImageLayer::new(
            payload.layer.clone(),
            THIN_LAYER_MEDIA_TYPE.to_string(),
            None,
        )];
        let config = Config::new(
            payload.config.clone(),
            IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );

        let response = self
            .client(reference)
            .push(&oci_ref, &layers, config, &auth.to_oci_auth(), None)
            .await
            .map_err(|e| registry_error(reference, format!("Failed to push image: {}", e)))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Thin image pushed"
        );
        Ok(response.manifest_url)
    }
}

/// Pick the linux image for the host architecture out of an index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
