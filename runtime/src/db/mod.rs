//! Conversion bookkeeping.
//!
//! Images, wishes, completed conversions and registry credentials. The
//! [`ConversionDb`] trait is what the pipeline, garbage collector and CLI use;
//! [`JsonDatabase`] is the file-backed implementation.

pub mod json;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thinimage_core::error::Result;
use thinimage_core::{strip_digest_scheme, Image, ImageManifest, ImageRef, LayerSet, Wish};

pub use json::JsonDatabase;

/// A successful conversion of one wish at one source digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub wish: u64,
    /// Config digest of the converted input image
    pub input_reference: String,
    pub manifest: ImageManifest,
    pub converted_at: DateTime<Utc>,
}

impl ConversionRecord {
    /// Store paths (`<repo>/<subdir>/<hex>`) of every layer of the record.
    pub fn layer_paths(&self, repo: &str, layers_subdir: &str) -> Vec<String> {
        self.manifest
            .layers
            .iter()
            .map(|l| format!("{}/{}/{}", repo, layers_subdir, strip_digest_scheme(&l.digest)))
            .collect()
    }
}

/// Wish joined with the names of its images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WishInfo {
    pub id: u64,
    pub input_id: u64,
    pub input_name: String,
    pub output_id: u64,
    pub output_name: String,
    pub repo: String,
    pub converted: bool,
}

/// User known for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub registry: String,
    pub password: String,
}

pub trait ConversionDb: Send + Sync {
    /// Record an image, returning the existing row if the reference is known.
    fn add_image(&self, user: Option<&str>, reference: &ImageRef, is_thin: bool) -> Result<Image>;

    fn get_image(&self, reference: &ImageRef) -> Result<Option<Image>>;

    /// Fails with `NotFound` for an unknown id.
    fn get_image_by_id(&self, id: u64) -> Result<Image>;

    fn list_images(&self) -> Result<Vec<Image>>;

    /// Fails with `WishAlreadyExists` if (input, output, repo) is recorded.
    fn add_wish(&self, input_image: u64, output_image: u64, repo: &str) -> Result<Wish>;

    fn get_wish(&self, input_image: u64, output_image: u64, repo: &str) -> Result<Option<Wish>>;

    fn get_wish_by_id(&self, id: u64) -> Result<Wish>;

    fn list_wishes(&self) -> Result<Vec<WishInfo>>;

    /// Delete a wish with its conversion records. Returns the rows removed.
    fn delete_wish(&self, id: u64) -> Result<usize>;

    /// Record a completed conversion. Re-recording the same digest is a no-op.
    fn add_conversion_record(&self, wish: u64, manifest: &ImageManifest) -> Result<()>;

    fn already_converted(&self, wish: u64, config_digest: &str) -> Result<bool>;

    fn conversions(&self) -> Result<Vec<ConversionRecord>>;

    /// Drop conversion records of one wish, or all of them, returning what was dropped.
    fn delete_conversions(&self, wish: Option<u64>) -> Result<Vec<ConversionRecord>>;

    /// Store paths of every layer some recorded conversion still needs.
    fn needed_layers(&self, layers_subdir: &str) -> Result<LayerSet>;

    /// Add or replace the password of `user` on `registry`.
    fn add_credential(&self, user: &str, registry: &str, password: &str) -> Result<()>;

    fn get_credential(&self, user: &str, registry: &str) -> Result<Option<String>>;

    fn list_users(&self) -> Result<Vec<(String, String)>>;
}
