//! Lower-layer resolution.
//!
//! Turns a layer id into the list of directories to stack under it. Ordinary
//! ancestors contribute their diff directory. A thin ancestor is replaced by
//! the store directories its descriptor lists, after the store repositories
//! holding them have been acquired.

use std::path::PathBuf;
use std::sync::Arc;

use thinimage_core::error::Result;
use thinimage_core::ThinImage;

use super::layout::DriverLayout;
use crate::store::StoreManager;

/// What a layer diff directory stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerSegment {
    /// Plain content layer
    Ordinary(PathBuf),
    /// Thin layer: the content lives in the store
    External(ThinImage),
}

impl LayerSegment {
    /// Classify a diff directory by the presence of the thin marker.
    pub fn classify(diff_dir: PathBuf) -> Result<Self> {
        Ok(match ThinImage::read_from_dir(&diff_dir)? {
            Some(thin) => LayerSegment::External(thin),
            None => LayerSegment::Ordinary(diff_dir),
        })
    }
}

/// Result of a resolve call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedLayers {
    /// Lower directories, root first
    pub paths: Vec<PathBuf>,
    /// Repositories acquired for this resolve; the caller releases them
    pub repos: Vec<String>,
    /// Descriptor of the thin ancestor that was expanded
    pub thin: Option<ThinImage>,
}

impl ResolvedLayers {
    /// Lower directories newest first, the order overlayfs stacks them.
    pub fn top_down(&self) -> Vec<PathBuf> {
        self.paths.iter().rev().cloned().collect()
    }
}

pub struct LayerPathResolver {
    layout: Arc<DriverLayout>,
    store: Arc<StoreManager>,
}

impl LayerPathResolver {
    pub fn new(layout: Arc<DriverLayout>, store: Arc<StoreManager>) -> Self {
        Self { layout, store }
    }

    /// Classify every ancestor of `id`, root first.
    pub fn segments(&self, id: &str) -> Result<Vec<LayerSegment>> {
        self.layout
            .ancestors(id)?
            .into_iter()
            .map(|ancestor| LayerSegment::classify(self.layout.diff_dir(&ancestor)))
            .collect()
    }

    /// Nearest thin ancestor of `id`, if any.
    pub fn nearest_thin(&self, id: &str) -> Result<Option<ThinImage>> {
        for ancestor in self.layout.chain(id)? {
            if let Some(thin) = ThinImage::read_from_dir(&self.layout.diff_dir(&ancestor))? {
                return Ok(Some(thin));
            }
        }
        Ok(None)
    }

    /// Resolve the lower directories of `id`.
    ///
    /// Without a thin ancestor no store repository is touched. With one, its
    /// repositories are acquired all-or-nothing before any path is produced.
    pub fn resolve(&self, id: &str) -> Result<ResolvedLayers> {
        let segments = self.segments(id)?;

        // The thin marker closest to the leaf wins; farther ones are superseded.
        let nearest = segments.iter().enumerate().rev().find_map(|(i, s)| match s {
            LayerSegment::External(thin) => Some((i, thin.clone())),
            LayerSegment::Ordinary(_) => None,
        });

        let Some((thin_at, thin)) = nearest else {
            let paths = segments
                .into_iter()
                .filter_map(|s| match s {
                    LayerSegment::Ordinary(p) => Some(p),
                    LayerSegment::External(_) => None,
                })
                .collect();
            return Ok(ResolvedLayers {
                paths,
                ..Default::default()
            });
        };

        let repos = self.store.acquire_all(&thin.repos())?;

        let mut paths = Vec::with_capacity(segments.len() + thin.layers.len());
        for (index, segment) in segments.into_iter().enumerate() {
            match segment {
                LayerSegment::Ordinary(path) => paths.push(path),
                LayerSegment::External(_) if index == thin_at => {
                    paths.extend(
                        thin.layers
                            .iter()
                            .map(|l| self.store.root().join(l.locator.relative_path())),
                    );
                }
                LayerSegment::External(_) => {
                    tracing::debug!(position = index, "Ignoring superseded thin ancestor");
                }
            }
        }

        tracing::debug!(
            layer = %id,
            lowers = paths.len(),
            repos = ?repos,
            "Resolved thin layer chain"
        );

        Ok(ResolvedLayers {
            paths,
            repos,
            thin: Some(thin),
        })
    }
}
