//! Union mounts.

use std::path::{Path, PathBuf};

use thinimage_core::error::{Result, ThinError};

/// Union filesystem backend.
pub trait UnionMounter: Send + Sync {
    /// Mount `lower` (newest first) under the writable `upper` at `target`.
    fn mount(&self, lower: &[PathBuf], upper: &Path, work: &Path, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Kernel overlayfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayMounter;

/// Overlay mount data for the given directories.
pub fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lowerdir = lower
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    )
}

impl UnionMounter for OverlayMounter {
    fn mount(&self, lower: &[PathBuf], upper: &Path, work: &Path, target: &Path) -> Result<()> {
        if lower.is_empty() {
            return Err(ThinError::Mount {
                target: target.display().to_string(),
                message: "overlay needs at least one lower directory".to_string(),
            });
        }
        let options = overlay_options(lower, upper, work);

        #[cfg(target_os = "linux")]
        {
            use nix::mount::{mount, MsFlags};

            mount(
                Some("overlay"),
                target,
                Some("overlay"),
                MsFlags::empty(),
                Some(options.as_str()),
            )
            .map_err(|e| ThinError::Mount {
                target: target.display().to_string(),
                message: e.to_string(),
            })?;
            tracing::debug!(target = %target.display(), lowers = lower.len(), "Overlay mounted");
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = options;
            Err(ThinError::Mount {
                target: target.display().to_string(),
                message: "overlay mounts are only supported on Linux".to_string(),
            })
        }
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            use nix::mount::{umount2, MntFlags};

            umount2(target, MntFlags::MNT_DETACH).map_err(|e| ThinError::Mount {
                target: target.display().to_string(),
                message: e.to_string(),
            })?;
            tracing::debug!(target = %target.display(), "Overlay unmounted");
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(ThinError::Mount {
                target: target.display().to_string(),
                message: "overlay mounts are only supported on Linux".to_string(),
            })
        }
    }
}
