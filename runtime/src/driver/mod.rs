//! Overlay graph driver aware of thin layers.
//!
//! The driver keeps the usual graph-driver contract. Layers descending from a
//! thin image get their lower directories from the store, and committing such
//! a layer publishes the new content to the store and exports a new
//! descriptor instead of the raw content.

pub mod archive;
pub mod layout;
pub mod overlay;
pub mod plugin;
pub mod resolver;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thinimage_core::config::{MountMethod, ThinConfig};
use thinimage_core::error::{Result, ThinError};
use thinimage_core::{StoreLocator, ThinImage, ThinLayer};

use crate::store::{Cvmfs2Mounter, CvmfsServer, RepoMounter, StoreManager, StorePublisher};
pub use archive::{Change, ChangeKind};
pub use layout::DriverLayout;
pub use overlay::{OverlayMounter, UnionMounter};
pub use resolver::{LayerPathResolver, LayerSegment, ResolvedLayers};

/// Driver name reported to the engine.
pub const DRIVER_NAME: &str = "thin-overlay";

/// Mount state of one layer.
#[derive(Debug, Default)]
struct ActiveMount {
    count: usize,
    /// Whether an overlay is mounted at the mnt directory
    mounted: bool,
    /// Store repositories acquired by the first Get
    repos: Vec<String>,
}

/// Driver status, reported as key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub root: PathBuf,
    pub backing_fs: String,
    pub layers: usize,
    pub mounted: usize,
    pub store_repos: Vec<(String, usize)>,
}

impl DriverStatus {
    pub fn pairs(&self) -> Vec<[String; 2]> {
        let repos = self
            .store_repos
            .iter()
            .map(|(r, c)| format!("{}({})", r, c))
            .collect::<Vec<_>>()
            .join(",");
        vec![
            ["Root Dir".to_string(), self.root.display().to_string()],
            ["Backing Filesystem".to_string(), self.backing_fs.clone()],
            ["Dirs".to_string(), self.layers.to_string()],
            ["Mounted".to_string(), self.mounted.to_string()],
            ["Store Repos".to_string(), repos],
        ]
    }
}

pub struct UnionMountDriver {
    layout: Arc<DriverLayout>,
    store: Arc<StoreManager>,
    resolver: LayerPathResolver,
    mounter: Arc<dyn UnionMounter>,
    publisher: Option<Arc<dyn StorePublisher>>,
    publish_repo: Option<String>,
    layers_subdir: String,
    active: Mutex<HashMap<String, Arc<Mutex<ActiveMount>>>>,
}

impl UnionMountDriver {
    pub fn new(
        config: &ThinConfig,
        mounter: Arc<dyn UnionMounter>,
        repo_mounter: Arc<dyn RepoMounter>,
        publisher: Option<Arc<dyn StorePublisher>>,
    ) -> Result<Self> {
        let layout = Arc::new(DriverLayout::new(config.driver.root.clone()));
        layout.init()?;
        let store = Arc::new(StoreManager::new(
            config.store.root.clone(),
            config.driver.mount_method,
            repo_mounter,
        ));
        let resolver = LayerPathResolver::new(layout.clone(), store.clone());

        tracing::info!(
            root = %layout.root().display(),
            store = %store.root().display(),
            mount_method = ?config.driver.mount_method,
            publish_repo = ?config.driver.publish_repo,
            "Graph driver initialised"
        );

        Ok(Self {
            layout,
            store,
            resolver,
            mounter,
            publisher,
            publish_repo: config.driver.publish_repo.clone(),
            layers_subdir: config.store.layers_subdir.clone(),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Driver on overlayfs with `cvmfs2` mounts and `cvmfs_server` publishing.
    pub fn from_config(config: &ThinConfig) -> Result<Self> {
        let publisher: Option<Arc<dyn StorePublisher>> = config
            .driver
            .publish_repo
            .as_ref()
            .map(|_| Arc::new(CvmfsServer::from_config(&config.store)) as Arc<dyn StorePublisher>);
        Self::new(
            config,
            Arc::new(OverlayMounter),
            Arc::new(Cvmfs2Mounter::from_config(&config.driver)),
            publisher,
        )
    }

    /// Graph-driver `Init`: apply engine options on top of the configuration.
    pub fn init(config: &ThinConfig, home: Option<&Path>, options: &[String]) -> Result<Self> {
        let mut config = config.clone();
        if let Some(home) = home {
            config.driver.root = home.to_path_buf();
        }
        config.apply_driver_options(options)?;
        Self::from_config(&config)
    }

    pub fn layout(&self) -> &DriverLayout {
        &self.layout
    }

    pub fn store(&self) -> &StoreManager {
        &self.store
    }

    pub fn resolver(&self) -> &LayerPathResolver {
        &self.resolver
    }

    fn entry(&self, id: &str) -> Arc<Mutex<ActiveMount>> {
        self.active
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn ensure_exists(&self, id: &str) -> Result<()> {
        if self.layout.exists(id) {
            Ok(())
        } else {
            Err(ThinError::LayerNotFound(id.to_string()))
        }
    }

    pub fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.layout.create(id, parent)?;
        tracing::debug!(layer = %id, parent = ?parent, "Layer created");
        Ok(())
    }

    pub fn create_read_write(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.create(id, parent)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.exists(id)
    }

    /// Mount the layer and return its root filesystem path.
    ///
    /// A layer without ancestors is its own diff directory and is not mounted.
    pub fn get(&self, id: &str) -> Result<PathBuf> {
        self.ensure_exists(id)?;
        let entry = self.entry(id);
        let mut state = entry.lock();

        if state.count > 0 {
            state.count += 1;
            tracing::debug!(layer = %id, count = state.count, "Layer already mounted");
            return Ok(self.root_path(id, state.mounted));
        }

        if self.layout.chain(id)?.is_empty() {
            state.count = 1;
            state.mounted = false;
            return Ok(self.layout.diff_dir(id));
        }

        let target = self.layout.mnt_dir(id);
        std::fs::create_dir_all(&target)?;

        let resolved = self.resolver.resolve(id)?;
        let lowers = resolved.top_down();
        if lowers.is_empty() {
            state.count = 1;
            state.mounted = false;
            state.repos = resolved.repos;
            return Ok(self.layout.diff_dir(id));
        }

        if let Err(e) = self.mounter.mount(
            &lowers,
            &self.layout.diff_dir(id),
            &self.layout.work_dir(id),
            &target,
        ) {
            self.store.release_many(&resolved.repos);
            return Err(e);
        }

        tracing::info!(
            layer = %id,
            lowers = lowers.len(),
            thin = resolved.thin.is_some(),
            "Layer mounted"
        );
        state.count = 1;
        state.mounted = true;
        state.repos = resolved.repos;
        Ok(target)
    }

    fn root_path(&self, id: &str, mounted: bool) -> PathBuf {
        if mounted {
            self.layout.mnt_dir(id)
        } else {
            self.layout.diff_dir(id)
        }
    }

    /// Release one Get; the last one unmounts and releases store repositories.
    pub fn put(&self, id: &str) -> Result<()> {
        let entry = self.entry(id);
        let mut state = entry.lock();

        if state.count == 0 {
            tracing::warn!(layer = %id, "Put on a layer that is not mounted");
            return Ok(());
        }
        if state.count > 1 {
            state.count -= 1;
            return Ok(());
        }

        // The last reference stays until the overlay is gone, so a retried Put unmounts again.
        if state.mounted {
            self.mounter.unmount(&self.layout.mnt_dir(id))?;
            state.mounted = false;
            tracing::info!(layer = %id, "Layer unmounted");
        }
        state.count = 0;
        let repos = std::mem::take(&mut state.repos);
        self.store.release_many(&repos);
        Ok(())
    }

    /// Number of active Gets on `id`.
    pub fn active_count(&self, id: &str) -> usize {
        self.active
            .lock()
            .get(id)
            .map(|e| e.lock().count)
            .unwrap_or(0)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let entry = self.entry(id);
        let state = entry.lock();
        if state.count > 0 {
            return Err(ThinError::LayerBusy {
                id: id.to_string(),
                count: state.count,
            });
        }
        self.layout.remove(id)?;
        drop(state);
        self.active.lock().remove(id);
        tracing::debug!(layer = %id, "Layer removed");
        Ok(())
    }

    pub fn get_metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        self.ensure_exists(id)?;
        let mut meta = HashMap::new();
        meta.insert(
            "UpperDir".to_string(),
            self.layout.diff_dir(id).display().to_string(),
        );
        meta.insert(
            "WorkDir".to_string(),
            self.layout.work_dir(id).display().to_string(),
        );
        meta.insert(
            "MergedDir".to_string(),
            self.layout.mnt_dir(id).display().to_string(),
        );
        Ok(meta)
    }

    pub fn status(&self) -> Result<DriverStatus> {
        let mounted = self
            .active
            .lock()
            .values()
            .filter(|e| e.lock().count > 0)
            .count();
        Ok(DriverStatus {
            root: self.layout.root().to_path_buf(),
            backing_fs: backing_fs(self.layout.root()),
            layers: self.layout.list()?.len(),
            mounted,
            store_repos: self.store.mounted_repos(),
        })
    }

    /// Unmount every layer and force-release every store repository.
    ///
    /// Individual failures are logged; cleanup keeps going.
    pub fn cleanup(&self) -> Result<()> {
        let entries: Vec<(String, Arc<Mutex<ActiveMount>>)> =
            self.active.lock().drain().collect();
        for (id, entry) in entries {
            let mut state = entry.lock();
            if state.mounted {
                if let Err(e) = self.mounter.unmount(&self.layout.mnt_dir(&id)) {
                    tracing::warn!(layer = %id, error = %e, "Unmount during cleanup failed");
                }
            }
            *state = ActiveMount::default();
        }
        self.store.release_all()?;
        tracing::info!("Graph driver cleaned up");
        Ok(())
    }

    /// Export the changes of `id` as a layer tarball.
    ///
    /// For a layer descending from a thin image the content goes to the
    /// store and the tarball carries the extended descriptor only.
    pub fn diff<W: Write>(&self, id: &str, parent: Option<&str>, writer: W) -> Result<()> {
        self.ensure_exists(id)?;
        self.check_parent(id, parent)?;

        let Some(thin) = self.resolver.nearest_thin(id)? else {
            return archive::export_diff(&self.layout.diff_dir(id), writer);
        };

        let thin = self.externalize(id, thin)?;
        archive::export_thin(&thin, writer)
    }

    /// Publish the diff of `id` into the store and return the extended descriptor.
    fn externalize(&self, id: &str, mut thin: ThinImage) -> Result<ThinImage> {
        let repo = self.publish_repo.as_deref().ok_or_else(|| {
            ThinError::ConfigError(
                "committing on top of a thin image needs a publish repository".to_string(),
            )
        })?;
        let publisher = self.publisher.as_ref().ok_or_else(|| {
            ThinError::ConfigError("no store publisher configured".to_string())
        })?;

        let tmp = tempfile::tempdir()?;
        let tar_path = tmp.path().join("layer.tar");
        let digest = archive::export_diff_to_file(&self.layout.diff_dir(id), &tar_path)?;
        let subpath = format!("{}/{}", self.layers_subdir, digest);

        if publisher.contains(repo, &subpath) {
            tracing::info!(layer = %id, digest = %digest, "Layer content already in the store");
        } else {
            tracing::info!(layer = %id, repo = %repo, digest = %digest, "Publishing committed layer");
            publisher
                .ingest_tar(repo, &tar_path, &subpath)
                .map_err(|e| ThinError::Ingest {
                    layer: digest.clone(),
                    message: e.to_string(),
                })?;
            self.store.remount_after_publish(repo)?;
        }

        thin.push_layer(ThinLayer {
            digest,
            locator: StoreLocator::new(repo, subpath),
        });
        Ok(thin)
    }

    fn check_parent(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let recorded = self.layout.parent(id)?;
        match parent.filter(|p| !p.is_empty()) {
            Some(p) if recorded.as_deref() != Some(p) => Err(ThinError::Driver(format!(
                "layer {} has parent {:?}, not {}",
                id, recorded, p
            ))),
            _ => Ok(()),
        }
    }

    /// Changes of `id` relative to its lower layers.
    pub fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>> {
        self.ensure_exists(id)?;
        self.check_parent(id, parent)?;
        let resolved = self.resolver.resolve(id)?;
        let result = archive::changes(&resolved.top_down(), &self.layout.diff_dir(id));
        self.store.release_many(&resolved.repos);
        result
    }

    /// Unpack a layer tarball into `id`, returning its size.
    pub fn apply_diff<R: Read>(&self, id: &str, parent: Option<&str>, reader: R) -> Result<u64> {
        self.ensure_exists(id)?;
        self.check_parent(id, parent)?;
        let size = archive::apply_diff(reader, &self.layout.diff_dir(id))?;
        tracing::debug!(layer = %id, size, thin = ThinImage::is_thin_dir(&self.layout.diff_dir(id)), "Diff applied");
        Ok(size)
    }

    pub fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        self.ensure_exists(id)?;
        self.check_parent(id, parent)?;
        archive::dir_size(&self.layout.diff_dir(id))
    }

    pub fn mount_method(&self) -> MountMethod {
        self.store.method()
    }
}

#[cfg(target_os = "linux")]
fn backing_fs(path: &Path) -> String {
    match nix::sys::statfs::statfs(path) {
        Ok(stat) => format!("{:#x}", stat.filesystem_type().0),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(not(target_os = "linux"))]
fn backing_fs(_path: &Path) -> String {
    "unknown".to_string()
}
