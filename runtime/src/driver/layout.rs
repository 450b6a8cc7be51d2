//! On-disk layout of the driver root.
//!
//! ```text
//! <root>/diff/<id>     layer content (overlay upperdir)
//! <root>/mnt/<id>      union mount target
//! <root>/work/<id>     overlay workdir
//! <root>/layers/<id>   ancestor ids, closest first, one per line
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use thinimage_core::error::{Result, ThinError};

const REMOVING_SUFFIX: &str = "-removing";

#[derive(Debug, Clone)]
pub struct DriverLayout {
    root: PathBuf,
}

impl DriverLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the top-level directories.
    pub fn init(&self) -> Result<()> {
        for sub in ["diff", "mnt", "work", "layers"] {
            let dir = self.root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| {
                ThinError::Driver(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn diff_dir(&self, id: &str) -> PathBuf {
        self.root.join("diff").join(id)
    }

    pub fn mnt_dir(&self, id: &str) -> PathBuf {
        self.root.join("mnt").join(id)
    }

    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.root.join("work").join(id)
    }

    pub fn chain_file(&self, id: &str) -> PathBuf {
        self.root.join("layers").join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.diff_dir(id).is_dir()
    }

    /// Create the directories and chain record of a new layer.
    pub fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        validate_id(id)?;
        if self.exists(id) {
            return Err(ThinError::Driver(format!("layer {} already exists", id)));
        }

        let mut chain: Vec<String> = Vec::new();
        if let Some(parent) = parent.filter(|p| !p.is_empty()) {
            if !self.exists(parent) {
                return Err(ThinError::LayerNotFound(parent.to_string()));
            }
            chain.push(parent.to_string());
            chain.extend(self.chain(parent)?);
        }

        for dir in [self.diff_dir(id), self.mnt_dir(id), self.work_dir(id)] {
            std::fs::create_dir_all(&dir)?;
        }

        let path = self.chain_file(id);
        let mut file = std::fs::File::create(&path)?;
        for ancestor in &chain {
            writeln!(file, "{}", ancestor)?;
        }
        Ok(())
    }

    /// Ancestor ids, closest first. A layer without chain record has none.
    pub fn chain(&self, id: &str) -> Result<Vec<String>> {
        let path = self.chain_file(id);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ThinError::Driver(format!(
                "failed to read chain of {}: {}",
                id, e
            ))),
        }
    }

    /// Ancestor ids, root first.
    pub fn ancestors(&self, id: &str) -> Result<Vec<String>> {
        let mut chain = self.chain(id)?;
        chain.reverse();
        Ok(chain)
    }

    pub fn parent(&self, id: &str) -> Result<Option<String>> {
        Ok(self.chain(id)?.into_iter().next())
    }

    /// Rename the layer directories out of the way, then delete them and
    /// the chain record.
    pub fn remove(&self, id: &str) -> Result<()> {
        for dir in [self.mnt_dir(id), self.diff_dir(id), self.work_dir(id)] {
            if !dir.exists() {
                continue;
            }
            let mut removing = dir.clone().into_os_string();
            removing.push(REMOVING_SUFFIX);
            let removing = PathBuf::from(removing);
            std::fs::rename(&dir, &removing).map_err(|e| {
                ThinError::Driver(format!("failed to rename {}: {}", dir.display(), e))
            })?;
            std::fs::remove_dir_all(&removing).map_err(|e| {
                ThinError::Driver(format!("failed to remove {}: {}", removing.display(), e))
            })?;
        }
        match std::fs::remove_file(self.chain_file(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all layers.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.root.join("diff");
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if !name.ends_with(REMOVING_SUFFIX) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(ThinError::Driver(format!("invalid layer id: {:?}", id)));
    }
    Ok(())
}
