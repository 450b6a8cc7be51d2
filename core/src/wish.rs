//! Conversion work items.
//!
//! A wish says "convert this input image into that thin output image, publishing
//! layers into this store repository". Recipes describe a whole wish list
//! declaratively; [`diff_wishes`] turns a recipe into add/remove actions
//! against what is already recorded.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThinError};
use crate::reference::ImageRef;

/// Image known to the bookkeeping database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    /// User whose registry credentials apply to this image
    #[serde(default)]
    pub user: Option<String>,
    pub reference: ImageRef,
    #[serde(default)]
    pub is_thin: bool,
}

/// Recorded wish, images referenced by database id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wish {
    pub id: u64,
    pub input_image: u64,
    pub output_image: u64,
    pub repo: String,
}

impl Wish {
    /// Structural equality, ignoring the row id.
    pub fn same_target(&self, other: &Wish) -> bool {
        self.input_image == other.input_image
            && self.output_image == other.output_image
            && self.repo == other.repo
    }
}

/// Wish expressed with references rather than ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WishSpec {
    pub input: ImageRef,
    pub output: ImageRef,
    pub repo: String,
}

impl WishSpec {
    pub fn parse(input: &str, output: &str, repo: &str) -> Result<Self> {
        if repo.trim().is_empty() {
            return Err(ThinError::ConfigError("store repository is empty".to_string()));
        }
        Ok(Self {
            input: ImageRef::parse(input)?,
            output: ImageRef::parse(output)?,
            repo: repo.trim().to_string(),
        })
    }
}

/// Recipe file, version 1.
///
/// ```yaml
/// version: 1
/// user: smosciat
/// cvmfs_repo: images.example.org
/// output_format: https://registry.example.org/thin/$(image)
/// input:
///   - https://registry.hub.docker.com/library/redis:4
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub user: String,
    pub cvmfs_repo: String,
    pub output_format: String,
    #[serde(default)]
    pub input: Vec<String>,
}

impl Recipe {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let recipe: Recipe = serde_yaml::from_str(text)?;
        if recipe.version != 1 {
            return Err(ThinError::ConfigError(format!(
                "unsupported recipe version: {}",
                recipe.version
            )));
        }
        if recipe.cvmfs_repo.trim().is_empty() {
            return Err(ThinError::ConfigError(
                "recipe has no cvmfs_repo".to_string(),
            ));
        }
        Ok(recipe)
    }

    /// Expand the recipe into wishes, one per input image.
    pub fn wishes(&self) -> Result<Vec<WishSpec>> {
        self.input
            .iter()
            .map(|raw| {
                let input = ImageRef::parse(raw)?;
                let output = ImageRef::parse(&format_output(&self.output_format, &input))?;
                Ok(WishSpec {
                    input,
                    output,
                    repo: self.cvmfs_repo.clone(),
                })
            })
            .collect()
    }
}

/// Substitute `$(scheme)`, `$(registry)`, `$(repository)`, `$(tag)` and
/// `$(image)` (repository plus tag) in an output format string.
pub fn format_output(format: &str, input: &ImageRef) -> String {
    let tag = input.tag.clone().unwrap_or_else(|| "latest".to_string());
    let image = format!("{}:{}", input.repository, tag);
    format
        .replace("$(scheme)", &input.scheme)
        .replace("$(registry)", &input.registry)
        .replace("$(repository)", &input.repository)
        .replace("$(tag)", &tag)
        .replace("$(image)", &image)
}

/// Compare a desired wish list with the current one.
///
/// Returns `(to_add, to_remove)`: desired wishes not present yet, and current
/// wishes no longer desired. Duplicates in `desired` are added once.
pub fn diff_wishes<T>(desired: &[WishSpec], current: &[(T, WishSpec)]) -> (Vec<WishSpec>, Vec<T>)
where
    T: Clone,
{
    let mut to_add: Vec<WishSpec> = Vec::new();
    for wish in desired {
        let present = current.iter().any(|(_, c)| c == wish);
        if !present && !to_add.contains(wish) {
            to_add.push(wish.clone());
        }
    }
    let to_remove = current
        .iter()
        .filter(|(_, c)| !desired.contains(c))
        .map(|(key, _)| key.clone())
        .collect();
    (to_add, to_remove)
}
