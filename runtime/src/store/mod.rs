//! Distributed store access.
//!
//! Two concerns live here: publishing content into store repositories
//! through their transaction commands ([`StorePublisher`]), and mounting
//! repositories locally with reference counting ([`StoreManager`]).

pub mod cvmfs;
pub mod manager;
pub mod metadata;

use std::path::{Path, PathBuf};

use thinimage_core::error::{Result, ThinError};
use thinimage_core::LayerSet;

pub use cvmfs::{Cvmfs2Mounter, CvmfsServer};
pub use manager::{RepoMounter, StoreManager};

/// Transactional write access to store repositories.
///
/// Every method is a blocking call. Implementations abort the open
/// transaction before returning an error.
pub trait StorePublisher: Send + Sync {
    /// Mount root under which every repository is visible (`/cvmfs`).
    fn root(&self) -> &Path;

    fn transaction(&self, repo: &str) -> Result<()>;

    fn publish(&self, repo: &str) -> Result<()>;

    fn abort(&self, repo: &str) -> Result<()>;

    /// Unpack the tar file at `tar` into `<repo>/<subpath>`.
    fn ingest_tar(&self, repo: &str, tar: &Path, subpath: &str) -> Result<()>;

    /// Remove `<repo>/<subpath>`.
    fn delete(&self, repo: &str, subpath: &str) -> Result<()>;

    /// Path of `<repo>/<subpath>` under the store root.
    fn path_of(&self, repo: &str, subpath: &str) -> PathBuf {
        self.root().join(repo).join(subpath.trim_start_matches('/'))
    }

    /// Whether `<repo>/<subpath>` exists.
    fn contains(&self, repo: &str, subpath: &str) -> bool {
        self.path_of(repo, subpath).exists()
    }

    /// Read a file from the store, `None` if it does not exist.
    fn read_file(&self, repo: &str, subpath: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(repo, subpath);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ThinError::IoError(std::io::Error::new(
                e.kind(),
                format!("failed to read {}: {}", path.display(), e),
            ))),
        }
    }

    /// Write one file inside a transaction.
    fn write_file(&self, repo: &str, subpath: &str, bytes: &[u8]) -> Result<()> {
        self.write_files(repo, &[(subpath.to_string(), bytes.to_vec())])
    }

    /// Write several files inside a single transaction, aborting on failure.
    fn write_files(&self, repo: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
        self.transaction(repo)?;

        let written = files.iter().try_for_each(|(subpath, bytes)| {
            let path = self.path_of(repo, subpath);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, bytes)?;
            tracing::debug!(repo = %repo, file = %path.display(), "Wrote store file");
            Ok::<(), std::io::Error>(())
        });

        if let Err(e) = written {
            tracing::error!(repo = %repo, error = %e, "Failed to write store files, aborting");
            if let Err(abort_err) = self.abort(repo) {
                tracing::warn!(repo = %repo, error = %abort_err, "Abort failed");
            }
            return Err(ThinError::StoreCommand {
                command: "write".to_string(),
                repo: repo.to_string(),
                message: e.to_string(),
            });
        }

        self.publish(repo)
    }

    /// Every `<repo>/<layers_subdir>/<entry>` present under the store root.
    fn present_layers(&self, layers_subdir: &str) -> Result<LayerSet> {
        let mut set = LayerSet::new();
        let repos = match std::fs::read_dir(self.root()) {
            Ok(repos) => repos,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(set),
            Err(e) => return Err(e.into()),
        };
        for repo in repos {
            let repo = repo?;
            let repo_name = repo.file_name().to_string_lossy().to_string();
            let layers_dir = repo.path().join(layers_subdir);
            let Ok(layers) = std::fs::read_dir(&layers_dir) else {
                continue;
            };
            for layer in layers {
                let layer = layer?;
                set.insert(format!(
                    "{}/{}/{}",
                    repo_name,
                    layers_subdir,
                    layer.file_name().to_string_lossy()
                ));
            }
        }
        Ok(set)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeStore, StoreCall};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_runs_in_transaction() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(dir.path());
        store
            .write_file("repo.org", ".metadata/x.json", b"{}")
            .unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Transaction("repo.org".to_string()),
                StoreCall::Publish("repo.org".to_string()),
            ]
        );
        assert_eq!(
            store.read_file("repo.org", ".metadata/x.json").unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[test]
    fn test_write_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(dir.path());
        // A regular file where a directory is needed makes the write fail.
        std::fs::create_dir_all(dir.path().join("repo.org")).unwrap();
        std::fs::write(dir.path().join("repo.org/blocker"), b"x").unwrap();

        let result = store.write_file("repo.org", "blocker/inner.json", b"{}");
        assert!(matches!(result, Err(ThinError::StoreCommand { .. })));
        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Transaction("repo.org".to_string()),
                StoreCall::Abort("repo.org".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(dir.path());
        assert_eq!(store.read_file("repo.org", "nope").unwrap(), None);
        assert!(!store.contains("repo.org", "nope"));
    }

    #[test]
    fn test_present_layers() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("one.org/layers/aaa")).unwrap();
        std::fs::create_dir_all(dir.path().join("one.org/layers/bbb")).unwrap();
        std::fs::create_dir_all(dir.path().join("two.org/layers/ccc")).unwrap();
        std::fs::create_dir_all(dir.path().join("three.org/other")).unwrap();
        let store = FakeStore::new(dir.path());

        let present = store.present_layers("layers").unwrap();
        let items: Vec<&str> = present.iter().collect();
        assert_eq!(
            items,
            vec!["one.org/layers/aaa", "one.org/layers/bbb", "two.org/layers/ccc"]
        );
    }

    #[test]
    fn test_present_layers_missing_root() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(&dir.path().join("absent"));
        assert!(store.present_layers("layers").unwrap().is_empty());
    }
}
