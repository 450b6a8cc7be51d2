use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ThinError};

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "THINIMAGE_CONFIG";

/// Thin image tooling configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinConfig {
    /// Bookkeeping database
    pub database: DatabaseConfig,

    /// Distributed store
    pub store: StoreConfig,

    /// Conversion pipeline
    pub conversion: ConversionConfig,

    /// Graph driver
    pub driver: DriverConfig,
}

impl ThinConfig {
    /// Load configuration from an explicit path, `$THINIMAGE_CONFIG`, or
    /// `~/.thinimage/config.yaml`, in that order. A missing file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(|| default_home().map(|h| h.join("config.yaml"))),
        };

        match path {
            Some(p) if p.exists() => Self::from_file(&p),
            Some(p) if explicit.is_some() => Err(ThinError::ConfigError(format!(
                "config file not found: {}",
                p.display()
            ))),
            _ => Ok(Self::default()),
        }
    }

    /// Parse a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ThinError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

/// `~/.thinimage`
pub fn default_home() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".thinimage"))
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the JSON database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_home()
                .unwrap_or_else(|| PathBuf::from(".thinimage"))
                .join("database.json"),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Mount root of all store repositories
    pub root: PathBuf,

    /// Sub directory of a repository holding layers
    pub layers_subdir: String,

    /// Server-side transaction command
    pub server_command: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/cvmfs"),
            layers_subdir: "layers".to_string(),
            server_command: "cvmfs_server".to_string(),
        }
    }
}

impl StoreConfig {
    /// `<repo>/<layers_subdir>`, the store location new layers are published to.
    pub fn layers_location(&self, repo: &str) -> String {
        format!("{}/{}", repo, self.layers_subdir)
    }
}

/// Conversion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Capacity of the download to ingest handoff queue
    pub channel_capacity: usize,

    /// Directory for downloaded blobs (system temp when unset)
    pub temp_dir: Option<PathBuf>,

    /// Import the thin image into the local engine before pushing
    pub import_locally: bool,

    /// Container engine executable
    pub docker_command: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 3,
            temp_dir: None,
            import_locally: true,
            docker_command: "docker".to_string(),
        }
    }
}

/// How store repositories get mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountMethod {
    /// The driver mounts and unmounts repositories itself
    #[default]
    Internal,
    /// Repositories are mounted by someone else (autofs, host)
    External,
}

impl std::str::FromStr for MountMethod {
    type Err = ThinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(MountMethod::Internal),
            "external" => Ok(MountMethod::External),
            other => Err(ThinError::ConfigError(format!(
                "unknown mount method: {}",
                other
            ))),
        }
    }
}

/// Graph driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Driver state directory (diff/, mnt/, work/, layers/)
    pub root: PathBuf,

    pub mount_method: MountMethod,

    /// Repository that layers committed on top of thin images go to
    pub publish_repo: Option<String>,

    /// Store client configuration directory
    pub config_dir: PathBuf,

    /// Store public key directory
    pub keys_dir: PathBuf,

    /// Repository suffixes that need no local configuration
    pub preconfigured_suffixes: Vec<String>,

    pub mount_command: String,

    pub talk_command: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/thinimage/driver"),
            mount_method: MountMethod::Internal,
            publish_repo: None,
            config_dir: PathBuf::from("/etc/cvmfs/config.d"),
            keys_dir: PathBuf::from("/etc/cvmfs/keys"),
            preconfigured_suffixes: vec![".cern.ch".to_string()],
            mount_command: "cvmfs2".to_string(),
            talk_command: "cvmfs_talk".to_string(),
        }
    }
}

impl ThinConfig {
    /// Apply graph-driver `Init` options (`key=value`).
    pub fn apply_driver_options(&mut self, options: &[String]) -> Result<()> {
        for option in options {
            let (key, value) = option.split_once('=').ok_or_else(|| {
                ThinError::ConfigError(format!("invalid driver option: {}", option))
            })?;
            match key.trim() {
                "mountMethod" => self.driver.mount_method = value.trim().parse()?,
                "publishRepo" => self.driver.publish_repo = Some(value.trim().to_string()),
                "storeMountPath" => self.store.root = PathBuf::from(value.trim()),
                other => {
                    tracing::warn!(option = %other, "Ignoring unknown driver option");
                }
            }
        }
        Ok(())
    }
}
