//! Conversion of regular images into thin images.
//!
//! Layers are downloaded by an async producer and ingested into the store by
//! a blocking consumer, with a bounded channel between them. Once every layer
//! is in the store the thin descriptor is built, packaged as a single-file
//! layer, optionally imported into the local engine and pushed.

pub mod changes;
pub mod ingest;
pub mod pipeline;

pub use changes::{image_changes, thin_image_config};
pub use pipeline::{ConversionJob, ConversionOutcome, ConvertOptions, ConvertSummary, Converter};
