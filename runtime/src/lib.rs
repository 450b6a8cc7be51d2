//! Thin Image Runtime - store, driver and conversion.
//!
//! This crate provides the store repository manager, the store-aware union
//! graph driver, the conversion pipeline turning regular images into thin
//! images, and store garbage collection.

#![allow(clippy::result_large_err)]

pub mod convert;
pub mod db;
pub mod driver;
pub mod engine;
pub mod exec;
pub mod gc;
pub mod registry;
pub mod store;

// Re-export common types
pub use convert::{ConversionJob, ConversionOutcome, ConvertOptions, ConvertSummary, Converter};
pub use db::{ConversionDb, ConversionRecord, JsonDatabase, WishInfo};
pub use driver::plugin::PluginHandler;
pub use driver::{DriverStatus, LayerPathResolver, LayerSegment, ResolvedLayers, UnionMountDriver};
pub use engine::{ContainerEngine, DockerCli};
pub use gc::{GarbageCollector, GcReport};
pub use registry::{ImagePublisher, ImageSource, OciRegistry, RegistryAuth};
pub use store::{Cvmfs2Mounter, CvmfsServer, RepoMounter, StoreManager, StorePublisher};

/// Thin Image Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
