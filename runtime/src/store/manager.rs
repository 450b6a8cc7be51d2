//! Reference-counted store repository mounts.
//!
//! One [`StoreManager`] exists per driver instance. It is built at `Init` and
//! shared by reference with everything that needs store paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thinimage_core::config::MountMethod;
use thinimage_core::error::Result;

/// Mount backend for a single repository.
pub trait RepoMounter: Send + Sync {
    /// Fail with `StoreUnavailable` if the repository cannot be mounted here.
    fn check_configured(&self, repo: &str) -> Result<()>;

    fn mount(&self, repo: &str, target: &Path) -> Result<()>;

    fn unmount(&self, repo: &str, target: &Path) -> Result<()>;

    /// Make freshly published content visible without a remount cycle.
    fn remount(&self, repo: &str) -> Result<()>;
}

/// Refcounted mounts of store repositories under a common root.
pub struct StoreManager {
    root: PathBuf,
    method: MountMethod,
    mounter: Arc<dyn RepoMounter>,
    /// Active users per repository. The lock is held across mount syscalls.
    refs: Mutex<HashMap<String, usize>>,
}

impl StoreManager {
    pub fn new(root: impl Into<PathBuf>, method: MountMethod, mounter: Arc<dyn RepoMounter>) -> Self {
        Self {
            root: root.into(),
            method,
            mounter,
            refs: Mutex::new(HashMap::new()),
        }
    }

    /// Store mount root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn method(&self) -> MountMethod {
        self.method
    }

    pub fn mount_path(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    /// Take a reference on `repo`, mounting it on the first one.
    pub fn acquire(&self, repo: &str) -> Result<()> {
        let mut refs = self.refs.lock();
        let count = refs.get(repo).copied().unwrap_or(0);

        if count == 0 && self.method == MountMethod::Internal {
            self.mounter.check_configured(repo)?;
            let target = self.mount_path(repo);
            tracing::info!(repo = %repo, target = %target.display(), "Mounting store repository");
            self.mounter.mount(repo, &target)?;
        }

        refs.insert(repo.to_string(), count + 1);
        tracing::debug!(repo = %repo, refcount = count + 1, "Store repository acquired");
        Ok(())
    }

    /// Acquire every repository or none of them.
    ///
    /// Returns the repositories acquired, which the caller releases later.
    pub fn acquire_all(&self, repos: &[String]) -> Result<Vec<String>> {
        let mut acquired: Vec<String> = Vec::with_capacity(repos.len());
        for repo in repos {
            if let Err(e) = self.acquire(repo) {
                tracing::error!(repo = %repo, error = %e, "Failed to acquire store repository, rolling back");
                for done in acquired.iter().rev() {
                    if let Err(release_err) = self.release(done) {
                        tracing::warn!(repo = %done, error = %release_err, "Rollback release failed");
                    }
                }
                return Err(e);
            }
            acquired.push(repo.clone());
        }
        Ok(acquired)
    }

    /// Drop a reference on `repo`, unmounting it on the last one.
    pub fn release(&self, repo: &str) -> Result<()> {
        let mut refs = self.refs.lock();
        let count = match refs.get(repo).copied() {
            Some(c) if c > 0 => c,
            _ => {
                tracing::warn!(repo = %repo, "Release of a store repository that is not held");
                return Ok(());
            }
        };

        if count == 1 {
            if self.method == MountMethod::Internal {
                let target = self.mount_path(repo);
                tracing::info!(repo = %repo, target = %target.display(), "Unmounting store repository");
                self.mounter.unmount(repo, &target)?;
            }
            refs.remove(repo);
        } else {
            refs.insert(repo.to_string(), count - 1);
        }
        tracing::debug!(repo = %repo, refcount = count - 1, "Store repository released");
        Ok(())
    }

    pub fn release_many(&self, repos: &[String]) {
        for repo in repos {
            if let Err(e) = self.release(repo) {
                tracing::warn!(repo = %repo, error = %e, "Failed to release store repository");
            }
        }
    }

    /// Force every repository to zero references and unmount it.
    ///
    /// Unmount failures are logged and do not stop the drain.
    pub fn release_all(&self) -> Result<()> {
        let mut refs = self.refs.lock();
        for (repo, count) in refs.drain() {
            if self.method == MountMethod::Internal {
                let target = self.mount_path(&repo);
                if let Err(e) = self.mounter.unmount(&repo, &target) {
                    tracing::warn!(repo = %repo, refcount = count, error = %e, "Forced unmount failed");
                    continue;
                }
            }
            tracing::info!(repo = %repo, refcount = count, "Store repository force released");
        }
        Ok(())
    }

    /// Ask the store client to pick up freshly published content.
    pub fn remount_after_publish(&self, repo: &str) -> Result<()> {
        let refs = self.refs.lock();
        if self.method == MountMethod::External || !refs.contains_key(repo) {
            tracing::debug!(repo = %repo, "Repository not mounted by us, skipping remount");
            return Ok(());
        }
        tracing::info!(repo = %repo, "Remounting store repository");
        self.mounter.remount(repo)
    }

    pub fn refcount(&self, repo: &str) -> usize {
        self.refs.lock().get(repo).copied().unwrap_or(0)
    }

    pub fn is_mounted(&self, repo: &str) -> bool {
        self.refcount(repo) > 0
    }

    /// Repositories currently held, sorted by name.
    pub fn mounted_repos(&self) -> Vec<(String, usize)> {
        let mut repos: Vec<(String, usize)> = self
            .refs
            .lock()
            .iter()
            .map(|(r, c)| (r.clone(), *c))
            .collect();
        repos.sort();
        repos
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeMounter, MountCall};
    use super::*;
    use thinimage_core::error::ThinError;

    fn manager(method: MountMethod) -> (StoreManager, Arc<FakeMounter>) {
        let mounter = Arc::new(FakeMounter::default());
        (StoreManager::new("/cvmfs", method, mounter.clone()), mounter)
    }

    #[test]
    fn test_refcount_invariant_over_sequence() {
        let (m, mounter) = manager(MountMethod::Internal);
        let ops = [true, true, false, true, false, false, true, false];
        let mut balance: i64 = 0;
        for acquire in ops {
            if acquire {
                m.acquire("repo.org").unwrap();
                balance += 1;
            } else {
                m.release("repo.org").unwrap();
                balance -= 1;
            }
            assert_eq!(m.is_mounted("repo.org"), balance > 0);
            assert_eq!(mounter.mounted().contains("repo.org"), balance > 0);
        }
        let mounts = mounter
            .calls()
            .iter()
            .filter(|c| matches!(c, MountCall::Mount(_)))
            .count();
        assert_eq!(mounts, 2);
    }

    #[test]
    fn test_second_acquire_does_not_remount() {
        let (m, mounter) = manager(MountMethod::Internal);
        m.acquire("repo.org").unwrap();
        m.acquire("repo.org").unwrap();
        assert_eq!(m.refcount("repo.org"), 2);
        assert_eq!(mounter.calls(), vec![MountCall::Mount("repo.org".to_string())]);
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let (m, mounter) = manager(MountMethod::Internal);
        m.release("repo.org").unwrap();
        assert_eq!(m.refcount("repo.org"), 0);
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn test_unconfigured_repo_fails_fast() {
        let (m, mounter) = manager(MountMethod::Internal);
        mounter.unconfigured.lock().insert("bad.org".to_string());
        let err = m.acquire("bad.org").unwrap_err();
        assert!(matches!(err, ThinError::StoreUnavailable { .. }));
        assert_eq!(m.refcount("bad.org"), 0);
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn test_acquire_all_rolls_back() {
        let (m, mounter) = manager(MountMethod::Internal);
        mounter.unconfigured.lock().insert("bad.org".to_string());
        let repos = vec!["a.org".to_string(), "b.org".to_string(), "bad.org".to_string()];
        assert!(m.acquire_all(&repos).is_err());
        assert_eq!(m.refcount("a.org"), 0);
        assert_eq!(m.refcount("b.org"), 0);
        assert!(mounter.mounted().is_empty());
    }

    #[test]
    fn test_acquire_all_success() {
        let (m, _) = manager(MountMethod::Internal);
        let repos = vec!["a.org".to_string(), "b.org".to_string()];
        assert_eq!(m.acquire_all(&repos).unwrap(), repos);
        assert!(m.is_mounted("a.org"));
        assert!(m.is_mounted("b.org"));
    }

    #[test]
    fn test_release_all_forces_zero() {
        let (m, mounter) = manager(MountMethod::Internal);
        m.acquire("a.org").unwrap();
        m.acquire("a.org").unwrap();
        m.acquire("b.org").unwrap();
        m.release_all().unwrap();
        assert!(!m.is_mounted("a.org"));
        assert!(!m.is_mounted("b.org"));
        assert!(mounter.mounted().is_empty());
        assert!(m.mounted_repos().is_empty());
    }

    #[test]
    fn test_external_method_never_mounts() {
        let (m, mounter) = manager(MountMethod::External);
        m.acquire("a.org").unwrap();
        assert!(m.is_mounted("a.org"));
        m.remount_after_publish("a.org").unwrap();
        m.release("a.org").unwrap();
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn test_remount_only_when_held() {
        let (m, mounter) = manager(MountMethod::Internal);
        m.remount_after_publish("a.org").unwrap();
        assert!(mounter.calls().is_empty());
        m.acquire("a.org").unwrap();
        m.remount_after_publish("a.org").unwrap();
        assert_eq!(
            mounter.calls(),
            vec![
                MountCall::Mount("a.org".to_string()),
                MountCall::Remount("a.org".to_string())
            ]
        );
    }

    #[test]
    fn test_mount_path() {
        let (m, _) = manager(MountMethod::Internal);
        assert_eq!(m.mount_path("a.org"), PathBuf::from("/cvmfs/a.org"));
    }
}
