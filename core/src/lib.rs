//! Thin Image Core - Foundational Types
//!
//! Error taxonomy, configuration, image references, the manifest and thin
//! descriptor model, wishes and recipes.

pub mod config;
pub mod error;
pub mod manifest;
pub mod reference;
pub mod set;
pub mod thin;
pub mod wish;

// Re-export commonly used types
pub use config::{MountMethod, ThinConfig};
pub use error::{Result, ThinError};
pub use manifest::{strip_digest_scheme, Descriptor, ImageConfig, ImageManifest};
pub use reference::ImageRef;
pub use set::LayerSet;
pub use thin::{StoreLocator, ThinImage, ThinLayer, THIN_MARKER};
pub use wish::{diff_wishes, Image, Recipe, Wish, WishSpec};

/// Thin image tooling version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
