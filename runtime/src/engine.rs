//! Local container engine.

use std::path::Path;

use thinimage_core::config::ConversionConfig;
use thinimage_core::error::{Result, ThinError};

use crate::exec;

/// Engine that can take a root filesystem tarball as a new image.
pub trait ContainerEngine: Send + Sync {
    /// Import `tar` under `reference`, applying Dockerfile-style `changes`.
    fn import(&self, tar: &Path, reference: &str, changes: &[String]) -> Result<()>;
}

/// `docker import` through the command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    command: String,
}

impl DockerCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.docker_command.clone())
    }
}

/// Arguments of `docker import` for the given changes and reference.
pub fn import_args<'a>(reference: &'a str, changes: &'a [String]) -> Vec<&'a str> {
    let mut args = vec!["import"];
    for change in changes {
        args.push("--change");
        args.push(change);
    }
    args.push("-");
    args.push(reference);
    args
}

impl ContainerEngine for DockerCli {
    fn import(&self, tar: &Path, reference: &str, changes: &[String]) -> Result<()> {
        tracing::info!(reference = %reference, changes = changes.len(), "Importing image locally");
        exec::run(&self.command, &import_args(reference, changes), Some(tar))
            .map(|_| ())
            .map_err(ThinError::Engine)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records imports.
    #[derive(Default)]
    pub struct FakeEngine {
        pub imports: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ContainerEngine for FakeEngine {
        fn import(&self, tar: &Path, reference: &str, changes: &[String]) -> Result<()> {
            assert!(tar.exists());
            self.imports
                .lock()
                .push((reference.to_string(), changes.to_vec()));
            Ok(())
        }
    }
}
