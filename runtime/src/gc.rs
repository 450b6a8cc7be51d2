//! Store garbage collection.
//!
//! A layer in the store is garbage when no recorded conversion lists it.

use std::sync::Arc;

use thinimage_core::error::Result;
use thinimage_core::LayerSet;

use crate::db::ConversionDb;
use crate::store::StorePublisher;

/// What a collection did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// `<repo>/<path>` entries deleted, or that would be in a dry run
    pub removed: Vec<String>,
    /// Entries whose delete failed, with the error
    pub failed: Vec<(String, String)>,
}

pub struct GarbageCollector {
    db: Arc<dyn ConversionDb>,
    store: Arc<dyn StorePublisher>,
    layers_subdir: String,
}

impl GarbageCollector {
    pub fn new(db: Arc<dyn ConversionDb>, store: Arc<dyn StorePublisher>, layers_subdir: impl Into<String>) -> Self {
        Self {
            db,
            store,
            layers_subdir: layers_subdir.into(),
        }
    }

    /// Layers present in the store that nothing references.
    pub fn garbage(&self) -> Result<LayerSet> {
        let present = self.store.present_layers(&self.layers_subdir)?;
        let referenced = self.db.needed_layers(&self.layers_subdir)?;
        tracing::debug!(present = present.len(), referenced = referenced.len(), "Computing garbage");
        Ok(present.difference(&referenced))
    }

    /// Delete unreferenced layers, one repository at a time and one entry at a time.
    ///
    /// A failed delete is logged and recorded; the rest still run.
    pub fn collect(&self, dry_run: bool) -> Result<GcReport> {
        let mut report = GcReport::default();
        for (repo, paths) in self.garbage()?.group_by_repo() {
            for path in paths {
                let entry = format!("{}/{}", repo, path);
                if dry_run {
                    tracing::info!(layer = %entry, "Would remove layer");
                    report.removed.push(entry);
                    continue;
                }
                match self.store.delete(&repo, &path) {
                    Ok(()) => {
                        tracing::info!(layer = %entry, "Removed layer");
                        report.removed.push(entry);
                    }
                    Err(e) => {
                        tracing::error!(layer = %entry, error = %e, "Failed to remove layer");
                        report.failed.push((entry, e.to_string()));
                    }
                }
            }
        }
        tracing::info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            dry_run,
            "Garbage collection finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JsonDatabase;
    use crate::store::testing::{FakeStore, StoreCall};
    use tempfile::TempDir;
    use thinimage_core::{Descriptor, ImageManifest, ImageRef};

    struct Fixture {
        dir: TempDir,
        db: Arc<JsonDatabase>,
        store: Arc<FakeStore>,
        gc: GarbageCollector,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(JsonDatabase::open(dir.path().join("db.json")).unwrap());
        let store = Arc::new(FakeStore::new(&dir.path().join("cvmfs")));
        let gc = GarbageCollector::new(db.clone(), store.clone(), "layers");
        Fixture { dir, db, store, gc }
    }

    fn present(f: &Fixture, entries: &[&str]) {
        for e in entries {
            std::fs::create_dir_all(f.dir.path().join("cvmfs").join(e)).unwrap();
        }
    }

    fn convert(f: &Fixture, repo: &str, layers: &[&str]) {
        let input = f
            .db
            .add_image(None, &ImageRef::parse(&format!("https://reg/{}:1", layers.join("-"))).unwrap(), false)
            .unwrap();
        let output = f
            .db
            .add_image(None, &ImageRef::parse(&format!("https://reg/thin-{}:1", layers.join("-"))).unwrap(), true)
            .unwrap();
        let wish = f.db.add_wish(input.id, output.id, repo).unwrap();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: String::new(),
            config: Descriptor {
                media_type: String::new(),
                size: 0,
                digest: format!("sha256:{}", layers.join("")),
            },
            layers: layers
                .iter()
                .map(|l| Descriptor {
                    media_type: String::new(),
                    size: 0,
                    digest: format!("sha256:{}", l),
                })
                .collect(),
        };
        f.db.add_conversion_record(wish.id, &manifest).unwrap();
    }

    #[test]
    fn test_removes_only_unreferenced() {
        let f = fixture();
        present(&f, &["a.org/layers/keep", "a.org/layers/drop", "b.org/layers/old"]);
        convert(&f, "a.org", &["keep"]);

        let report = f.gc.collect(false).unwrap();
        assert_eq!(report.removed, vec!["a.org/layers/drop", "b.org/layers/old"]);
        assert!(report.failed.is_empty());
        assert!(f.dir.path().join("cvmfs/a.org/layers/keep").exists());
        assert!(!f.dir.path().join("cvmfs/a.org/layers/drop").exists());
    }

    #[test]
    fn test_empty_reference_set_removes_everything() {
        let f = fixture();
        present(&f, &["a.org/layers/x", "a.org/layers/y"]);
        assert_eq!(f.gc.collect(false).unwrap().removed.len(), 2);
    }

    #[test]
    fn test_empty_store_removes_nothing() {
        let f = fixture();
        convert(&f, "a.org", &["x"]);
        let report = f.gc.collect(false).unwrap();
        assert!(report.removed.is_empty());
        assert!(f.store.calls().is_empty());
    }

    #[test]
    fn test_shared_layer_removed_once() {
        let f = fixture();
        present(&f, &["a.org/layers/shared"]);
        let count = f
            .gc
            .collect(false)
            .unwrap()
            .removed
            .iter()
            .filter(|e| e.ends_with("shared"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_delete_continues() {
        let f = fixture();
        present(&f, &["a.org/layers/bad", "a.org/layers/good", "b.org/layers/other"]);
        f.store.fail_delete.lock().insert("layers/bad".to_string());

        let report = f.gc.collect(false).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a.org/layers/bad");
        assert_eq!(report.removed, vec!["a.org/layers/good", "b.org/layers/other"]);
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let f = fixture();
        present(&f, &["a.org/layers/x"]);
        let report = f.gc.collect(true).unwrap();
        assert_eq!(report.removed, vec!["a.org/layers/x"]);
        assert!(!f
            .store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Delete { .. })));
        assert!(f.dir.path().join("cvmfs/a.org/layers/x").exists());
    }
}
