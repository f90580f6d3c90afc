//! Metadata synchronizer errors

use thiserror::Error;

/// Result type alias for metadata operations
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Errors raised by the metadata synchronizer
#[derive(Debug, Error)]
pub enum MetadataError {
    /// A git operation failed; usually transient (network, locks)
    #[error("git operation failed: {0}")]
    Git(String),

    /// The mirror configuration is unusable (bad key mode, oversized repo)
    #[error("mirror configuration error: {0}")]
    Config(String),

    /// A git operation outran its wall-clock budget
    #[error("git operation '{operation}' timed out")]
    Timeout { operation: String },

    /// Filesystem access under the mirror failed
    #[error("mirror IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The sync tripped a failure threshold and stopped
    #[error("sync aborted: {reason}")]
    Aborted { reason: String },

    /// The sync was cancelled by shutdown
    #[error("sync cancelled")]
    Cancelled,

    /// A referenced release does not exist
    #[error("unknown release '{0}'")]
    UnknownRelease(String),

    /// The store rejected a write
    #[error(transparent)]
    Storage(#[from] regtrack_storage::DatabaseError),
}

impl MetadataError {
    /// Whether the retry budget applies
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Git(_) | Self::Timeout { .. } | Self::Io(_))
    }
}
