//! `thinimage remove-converted` command.
//!
//! Forgets conversions so their layers become garbage, and adds their manifests
//! to the store's remove schedule.

use clap::Args;
use thinimage_runtime::store::metadata::schedule_removal;
use thinimage_runtime::{ConversionDb, CvmfsServer, StorePublisher};

use super::Context;

#[derive(Args)]
pub struct RemoveConvertedArgs {
    /// Only this wish; all conversions when omitted
    pub wish: Option<u64>,
}

pub async fn execute(

    args: RemoveConvertedArgs,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    let store = CvmfsServer::from_config(&ctx.config.store);
    let scheduled = remove_converted(db.as_ref(), &store, args.wish)?;
    println!("Scheduled {scheduled} manifests for removal");
    Ok(())
}

fn remove_converted(
    db: &dyn ConversionDb,
    store: &dyn StorePublisher,
    wish: Option<u64>,
) -> Result<usize, Box<dyn std::error::Error>> {
    if let Some(id) = wish {
        db.get_wish_by_id(id)?;
    }
    let repos: std::collections::HashMap<u64, String> = db
        .list_wishes()?
        .into_iter()
        .map(|w| (w.id, w.repo))
        .collect();

    let records = db.delete_conversions(wish)?;
    let mut scheduled = 0;
    for record in &records {
        let Some(repo) = repos.get(&record.wish) else {
            tracing::warn!(wish = record.wish, "Conversion of an unknown wish, not scheduling");
            continue;
        };
        match schedule_removal(store, repo, &record.manifest) {
            Ok(()) => scheduled += 1,
            Err(e) => tracing::error!(
                repo = %repo,
                image = %record.manifest.config_digest(),
                error = %e,
                "Cannot schedule manifest for removal"
            ),
        }
    }
    Ok(scheduled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::add_wish::record_wish;
    use tempfile::TempDir;
    use thinimage_core::{Descriptor, ImageManifest, WishSpec};
    use std::path::{Path, PathBuf};
    use thinimage_runtime::store::metadata::load_schedule;
    use thinimage_runtime::JsonDatabase;

    /// Plain directory standing in for the store; transactions are no-ops.
    struct DirStore(PathBuf);

    impl StorePublisher for DirStore {
        fn root(&self) -> &Path {
            &self.0
        }
        fn transaction(&self, _repo: &str) -> thinimage_core::Result<()> {
            Ok(())
        }
        fn publish(&self, _repo: &str) -> thinimage_core::Result<()> {
            Ok(())
        }
        fn abort(&self, _repo: &str) -> thinimage_core::Result<()> {
            Ok(())
        }
        fn ingest_tar(
            &self,
            _repo: &str,
            _tar: &Path,
            _subpath: &str,
        ) -> thinimage_core::Result<()> {
            Err(thinimage_core::ThinError::Other("not supported".to_string()))
        }
        fn delete(&self, repo: &str, subpath: &str) -> thinimage_core::Result<()> {
            Ok(std::fs::remove_dir_all(self.path_of(repo, subpath))?)
        }
    }

    fn manifest(config: &str) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: String::new(),
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                size: 10,
                digest: config.to_string(),
            },
            layers: Vec::new(),
        }
    }

    #[test]
    fn test_remove_converted_schedules_manifests() {
        let dir = TempDir::new().unwrap();
        let db = JsonDatabase::open(dir.path().join("db.json")).unwrap();
        let store = DirStore(dir.path().join("cvmfs"));
        let spec = WishSpec::parse(
            "https://registry.hub.docker.com/library/redis:4",
            "https://registry.example.org/thin/redis:4",
            "images.example.org",
        )
        .unwrap();
        let wish = record_wish(&db, None, &spec).unwrap().unwrap();
        db.add_conversion_record(wish.id, &manifest("sha256:aaa")).unwrap();

        assert_eq!(remove_converted(&db, &store, Some(wish.id)).unwrap(), 1);
        assert!(db.conversions().unwrap().is_empty());
        let schedule = load_schedule(&store, "images.example.org").unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].config_digest(), "sha256:aaa");
    }

    #[test]
    fn test_remove_converted_unknown_wish() {
        let dir = TempDir::new().unwrap();
        let db = JsonDatabase::open(dir.path().join("db.json")).unwrap();
        let store = DirStore(dir.path().join("cvmfs"));
        assert!(remove_converted(&db, &store, Some(42)).is_err());
    }
}
