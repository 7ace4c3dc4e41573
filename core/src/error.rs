use thiserror::Error;

/// Modpack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// Caller supplied a path, reference or argument that cannot be used
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Media type has no codec
    #[error("Unsupported codec type: {0}")]
    UnsupportedCodec(String),

    /// Manifest, tag, blob or repository does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not offered by this store backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Content did not hash to the digest it was committed under
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Digest cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Content store error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Layer, config or manifest build error
    #[error("Build error: {0}")]
    BuildError(String),

    /// The run was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Whether a retry policy may attempt the failed operation again.
    ///
    /// Input and integrity failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PackError::IoError(_)
                | PackError::TimeoutError(_)
                | PackError::StorageError(_)
                | PackError::RegistryError { .. }
                | PackError::BuildError(_)
                | PackError::CacheError(_)
                | PackError::Other(_)
        )
    }

    /// Prefix the error message with context, keeping the variant.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            PackError::InvalidInput(m) => PackError::InvalidInput(format!("{context}: {m}")),
            PackError::UnsupportedCodec(m) => {
                PackError::UnsupportedCodec(format!("{context}: {m}"))
            }
            PackError::NotFound(m) => PackError::NotFound(format!("{context}: {m}")),
            PackError::Unsupported(m) => PackError::Unsupported(format!("{context}: {m}")),
            PackError::TimeoutError(m) => PackError::TimeoutError(format!("{context}: {m}")),
            PackError::IoError(e) => {
                PackError::IoError(std::io::Error::new(e.kind(), format!("{context}: {e}")))
            }
            PackError::SerializationError(m) => {
                PackError::SerializationError(format!("{context}: {m}"))
            }
            PackError::ConfigError(m) => PackError::ConfigError(format!("{context}: {m}")),
            PackError::CacheError(m) => PackError::CacheError(format!("{context}: {m}")),
            PackError::StorageError(m) => PackError::StorageError(format!("{context}: {m}")),
            PackError::RegistryError { registry, message } => PackError::RegistryError {
                registry,
                message: format!("{context}: {message}"),
            },
            PackError::BuildError(m) => PackError::BuildError(format!("{context}: {m}")),
            PackError::Other(m) => PackError::Other(format!("{context}: {m}")),
            other @ (PackError::DigestMismatch { .. } | PackError::Cancelled) => other,
        }
    }
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PackError {
    fn from(err: serde_yaml::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

/// Result type alias for modpack operations
pub type Result<T> = std::result::Result<T, PackError>;
