//! CernVM-FS backends: `cvmfs_server` for publishing, `cvmfs2` for mounting.

use std::path::{Path, PathBuf};

use thinimage_core::config::{DriverConfig, StoreConfig};
use thinimage_core::error::{Result, ThinError};

use super::manager::RepoMounter;
use super::StorePublisher;
use crate::exec;

/// Publisher driving `cvmfs_server` on a release manager machine.
#[derive(Debug, Clone)]
pub struct CvmfsServer {
    command: String,
    root: PathBuf,
}

impl CvmfsServer {
    pub fn new(command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.server_command.clone(), config.root.clone())
    }

    fn server(&self, op: &str, repo: &str, args: &[&str]) -> Result<()> {
        exec::run(&self.command, args, None)
            .map(|_| ())
            .map_err(|message| ThinError::StoreCommand {
                command: op.to_string(),
                repo: repo.to_string(),
                message,
            })
    }

    /// Run `op`; on failure abort the transaction before returning the error.
    fn server_or_abort(&self, op: &str, repo: &str, args: &[&str]) -> Result<()> {
        let result = self.server(op, repo, args);
        if let Err(e) = &result {
            tracing::error!(repo = %repo, operation = %op, error = %e, "Store command failed, aborting");
            if let Err(abort_err) = self.abort(repo) {
                tracing::warn!(repo = %repo, error = %abort_err, "Abort failed");
            }
        }
        result
    }
}

impl StorePublisher for CvmfsServer {
    fn root(&self) -> &Path {
        &self.root
    }

    fn transaction(&self, repo: &str) -> Result<()> {
        tracing::info!(repo = %repo, "Opening transaction");
        self.server_or_abort("transaction", repo, &["transaction", repo])
    }

    fn publish(&self, repo: &str) -> Result<()> {
        tracing::info!(repo = %repo, "Publishing");
        self.server_or_abort("publish", repo, &["publish", repo])
    }

    fn abort(&self, repo: &str) -> Result<()> {
        tracing::info!(repo = %repo, "Aborting transaction");
        self.server("abort", repo, &["abort", "-f", repo])
    }

    fn ingest_tar(&self, repo: &str, tar: &Path, subpath: &str) -> Result<()> {
        let tar = tar.to_string_lossy();
        tracing::info!(repo = %repo, subpath = %subpath, "Ingesting tar");
        self.server_or_abort("ingest", repo, &["ingest", "-t", &tar, "-b", subpath, repo])
    }

    fn delete(&self, repo: &str, subpath: &str) -> Result<()> {
        tracing::info!(repo = %repo, subpath = %subpath, "Deleting from store");
        self.server_or_abort("delete", repo, &["ingest", "--delete", subpath, repo])
    }
}

/// Mounts repositories with the `cvmfs2` fuse client.
#[derive(Debug, Clone)]
pub struct Cvmfs2Mounter {
    mount_command: String,
    talk_command: String,
    config_dir: PathBuf,
    keys_dir: PathBuf,
    preconfigured_suffixes: Vec<String>,
}

impl Cvmfs2Mounter {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            mount_command: config.mount_command.clone(),
            talk_command: config.talk_command.clone(),
            config_dir: config.config_dir.clone(),
            keys_dir: config.keys_dir.clone(),
            preconfigured_suffixes: config.preconfigured_suffixes.clone(),
        }
    }

    fn is_preconfigured(&self, repo: &str) -> bool {
        self.preconfigured_suffixes
            .iter()
            .any(|suffix| repo.ends_with(suffix.as_str()))
    }
}

impl RepoMounter for Cvmfs2Mounter {
    fn check_configured(&self, repo: &str) -> Result<()> {
        if self.is_preconfigured(repo) {
            return Ok(());
        }
        let conf = self.config_dir.join(format!("{}.conf", repo));
        let key = self.keys_dir.join(format!("{}.pub", repo));
        for required in [&conf, &key] {
            if !required.exists() {
                return Err(ThinError::StoreUnavailable {
                    repo: repo.to_string(),
                    message: format!("missing {}", required.display()),
                });
            }
        }
        Ok(())
    }

    fn mount(&self, repo: &str, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target).map_err(|e| ThinError::StoreUnavailable {
            repo: repo.to_string(),
            message: format!("failed to create {}: {}", target.display(), e),
        })?;
        let target_str = target.to_string_lossy();
        exec::run(
            &self.mount_command,
            &[
                "-o",
                "rw,fsname=cvmfs2,allow_other,grab_mountpoint",
                repo,
                &target_str,
            ],
            None,
        )
        .map(|_| ())
        .map_err(|message| ThinError::StoreUnavailable {
            repo: repo.to_string(),
            message,
        })
    }

    fn unmount(&self, repo: &str, target: &Path) -> Result<()> {
        let target_str = target.to_string_lossy();
        exec::run("umount", &[&target_str], None)
            .map(|_| ())
            .map_err(|message| ThinError::Mount {
                target: format!("{} ({})", target.display(), repo),
                message,
            })
    }

    fn remount(&self, repo: &str) -> Result<()> {
        exec::run(&self.talk_command, &["-i", repo, "remount", "sync"], None)
            .map(|_| ())
            .map_err(|message| ThinError::StoreCommand {
                command: "remount".to_string(),
                repo: repo.to_string(),
                message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mounter(dir: &Path) -> Cvmfs2Mounter {
        let config = DriverConfig {
            config_dir: dir.join("config.d"),
            keys_dir: dir.join("keys"),
            ..Default::default()
        };
        Cvmfs2Mounter::from_config(&config)
    }

    #[test]
    fn test_check_configured_requires_conf_and_key() {
        let dir = TempDir::new().unwrap();
        let m = mounter(dir.path());

        let err = m.check_configured("images.example.org").unwrap_err();
        assert!(matches!(err, ThinError::StoreUnavailable { .. }));

        std::fs::create_dir_all(dir.path().join("config.d")).unwrap();
        std::fs::write(dir.path().join("config.d/images.example.org.conf"), "").unwrap();
        assert!(m.check_configured("images.example.org").is_err());

        std::fs::create_dir_all(dir.path().join("keys")).unwrap();
        std::fs::write(dir.path().join("keys/images.example.org.pub"), "").unwrap();
        assert!(m.check_configured("images.example.org").is_ok());
    }

    #[test]
    fn test_preconfigured_suffix_skips_check() {
        let dir = TempDir::new().unwrap();
        let m = mounter(dir.path());
        assert!(m.check_configured("unpacked.cern.ch").is_ok());
    }

    #[test]
    fn test_server_failure_maps_to_store_command() {
        let server = CvmfsServer::new("false", "/nonexistent");
        let err = server.publish("repo.org").unwrap_err();
        match err {
            ThinError::StoreCommand { command, repo, .. } => {
                assert_eq!(command, "publish");
                assert_eq!(repo, "repo.org");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_server_success() {
        let server = CvmfsServer::new("true", "/nonexistent");
        assert!(server.transaction("repo.org").is_ok());
        assert!(server.delete("repo.org", "layers/abc").is_ok());
    }
}
