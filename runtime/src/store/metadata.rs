//! Bookkeeping files kept inside store repositories.
//!
//! Backlinks record which images use a layer
//! (`.metadata/<layers>/<digest>/origin.json`), and the remove schedule lists
//! manifests whose content may be deleted (`.metadata/remove-schedule.json`).
//! The merge functions are pure; the `save_*` helpers wrap them in a store
//! transaction.

use serde::{Deserialize, Serialize};
use thinimage_core::error::Result;
use thinimage_core::ImageManifest;

use super::StorePublisher;

const METADATA_DIR: &str = ".metadata";
const BACKLINK_FILE: &str = "origin.json";
const REMOVE_SCHEDULE_FILE: &str = "remove-schedule.json";

/// Content of a backlink file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlink {
    #[serde(default)]
    pub origin: Vec<String>,
}

/// `.metadata/<layers_subdir>/<digest>/origin.json`
pub fn backlink_path(layers_subdir: &str, layer_digest: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        METADATA_DIR, layers_subdir, layer_digest, BACKLINK_FILE
    )
}

pub fn remove_schedule_path() -> String {
    format!("{}/{}", METADATA_DIR, REMOVE_SCHEDULE_FILE)
}

/// Add `image_digest` to an existing backlink file, if any.
pub fn merge_backlink(existing: Option<&[u8]>, image_digest: &str) -> Result<Backlink> {
    let mut backlink: Backlink = match existing {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
        _ => Backlink::default(),
    };
    if !backlink.origin.iter().any(|d| d == image_digest) {
        backlink.origin.push(image_digest.to_string());
    }
    Ok(backlink)
}

/// Add `manifest` to an existing remove schedule, deduplicated by config digest.
pub fn merge_schedule(existing: Option<&[u8]>, manifest: &ImageManifest) -> Result<Vec<ImageManifest>> {
    let mut schedule: Vec<ImageManifest> = match existing {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
        _ => Vec::new(),
    };
    if !schedule
        .iter()
        .any(|m| m.config_digest() == manifest.config_digest())
    {
        schedule.push(manifest.clone());
    }
    Ok(schedule)
}

/// Record that `image_digest` uses each of `layer_digests`, in one transaction.
///
/// Unreadable or corrupt backlink files are logged and skipped.
pub fn save_backlinks(
    store: &dyn StorePublisher,
    repo: &str,
    layers_subdir: &str,
    image_digest: &str,
    layer_digests: &[String],
) -> Result<()> {
    let mut files = Vec::with_capacity(layer_digests.len());
    for digest in layer_digests {
        let path = backlink_path(layers_subdir, digest);
        let merged = store
            .read_file(repo, &path)
            .and_then(|existing| merge_backlink(existing.as_deref(), image_digest));
        match merged.and_then(|b| Ok(serde_json::to_vec(&b)?)) {
            Ok(bytes) => files.push((path, bytes)),
            Err(e) => {
                tracing::error!(repo = %repo, file = %path, error = %e, "Skipping backlink");
            }
        }
    }
    if files.is_empty() {
        return Ok(());
    }
    tracing::info!(repo = %repo, image = %image_digest, count = files.len(), "Saving layer backlinks");
    store.write_files(repo, &files)
}

/// Add `manifest` to the remove schedule of `repo`.
pub fn schedule_removal(store: &dyn StorePublisher, repo: &str, manifest: &ImageManifest) -> Result<()> {
    let path = remove_schedule_path();
    let existing = store.read_file(repo, &path)?;
    let schedule = merge_schedule(existing.as_deref(), manifest)?;
    tracing::info!(repo = %repo, image = %manifest.config_digest(), "Adding manifest to remove schedule");
    store.write_file(repo, &path, &serde_json::to_vec(&schedule)?)
}

/// Read the remove schedule of `repo`.
pub fn load_schedule(store: &dyn StorePublisher, repo: &str) -> Result<Vec<ImageManifest>> {
    match store.read_file(repo, &remove_schedule_path())? {
        Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FakeStore;
    use tempfile::TempDir;
    use thinimage_core::Descriptor;

    fn manifest(config: &str) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: String::new(),
            config: Descriptor {
                media_type: String::new(),
                size: 0,
                digest: config.to_string(),
            },
            layers: vec![],
        }
    }

    #[test]
    fn test_merge_backlink_new_file() {
        let b = merge_backlink(None, "sha256:img").unwrap();
        assert_eq!(b.origin, vec!["sha256:img"]);
    }

    #[test]
    fn test_merge_backlink_never_duplicates() {
        let existing = br#"{"origin":["sha256:a"]}"#;
        let b = merge_backlink(Some(existing), "sha256:a").unwrap();
        assert_eq!(b.origin, vec!["sha256:a"]);
        let b = merge_backlink(Some(existing), "sha256:b").unwrap();
        assert_eq!(b.origin, vec!["sha256:a", "sha256:b"]);
    }

    #[test]
    fn test_merge_backlink_corrupt() {
        assert!(merge_backlink(Some(b"not json"), "sha256:a").is_err());
    }

    #[test]
    fn test_merge_schedule_dedup_by_config() {
        let first = merge_schedule(None, &manifest("sha256:one")).unwrap();
        let bytes = serde_json::to_vec(&first).unwrap();
        let again = merge_schedule(Some(&bytes), &manifest("sha256:one")).unwrap();
        assert_eq!(again.len(), 1);
        let more = merge_schedule(Some(&bytes), &manifest("sha256:two")).unwrap();
        assert_eq!(more.len(), 2);
    }

    #[test]
    fn test_save_backlinks_through_store() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(dir.path());
        let layers = vec!["aaa".to_string(), "bbb".to_string()];
        save_backlinks(&store, "repo.org", "layers", "sha256:img1", &layers).unwrap();
        save_backlinks(&store, "repo.org", "layers", "sha256:img2", &layers[..1]).unwrap();

        let bytes = store
            .read_file("repo.org", &backlink_path("layers", "aaa"))
            .unwrap()
            .unwrap();
        let b: Backlink = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(b.origin, vec!["sha256:img1", "sha256:img2"]);
    }

    #[test]
    fn test_schedule_removal_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(dir.path());
        schedule_removal(&store, "repo.org", &manifest("sha256:one")).unwrap();
        schedule_removal(&store, "repo.org", &manifest("sha256:one")).unwrap();
        schedule_removal(&store, "repo.org", &manifest("sha256:two")).unwrap();
        let schedule = load_schedule(&store, "repo.org").unwrap();
        let digests: Vec<&str> = schedule.iter().map(|m| m.config_digest()).collect();
        assert_eq!(digests, vec!["sha256:one", "sha256:two"]);
    }
}
