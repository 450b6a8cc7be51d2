use thiserror::Error;

/// Thin image error types
#[derive(Error, Debug)]
pub enum ThinError {
    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Container registry error (network, auth, malformed response)
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Store repository is not configured or could not be mounted
    #[error("Store unavailable: {repo} - {message}")]
    StoreUnavailable { repo: String, message: String },

    /// A store transaction command failed
    #[error("Store command failed: {command} on {repo} - {message}")]
    StoreCommand {
        command: String,
        repo: String,
        message: String,
    },

    /// Ingesting a layer into the store failed
    #[error("Ingest failed for layer {layer}: {message}")]
    Ingest { layer: String, message: String },

    /// Union mount or unmount failed
    #[error("Mount error: {target} - {message}")]
    Mount { target: String, message: String },

    /// Layer id is unknown to the driver
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    /// Layer still has active mounts
    #[error("Layer {id} is busy: {count} active mounts")]
    LayerBusy { id: String, count: usize },

    /// Local container engine refused an import
    #[error("Container engine error: {0}")]
    Engine(String),

    /// Generic graph-driver error
    #[error("Driver error: {0}")]
    Driver(String),

    /// The wish is already recorded
    #[error("Wish already in the database: {input} -> {output} ({repo})")]
    WishAlreadyExists {
        input: String,
        output: String,
        repo: String,
    },

    /// Lookup returned nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence layer error
    #[error("Database error: {0}")]
    Database(String),

    /// Work stopped after an interrupt signal
    #[error("Interrupted")]
    Interrupted,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ThinError {
    /// Whether the error is the non-fatal "wish already present" conflict.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ThinError::WishAlreadyExists { .. })
    }
}

impl From<serde_json::Error> for ThinError {
    fn from(err: serde_json::Error) -> Self {
        ThinError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ThinError {
    fn from(err: serde_yaml::Error) -> Self {
        ThinError::SerializationError(err.to_string())
    }
}

/// Result type alias for thin image operations
pub type Result<T> = std::result::Result<T, ThinError>;
