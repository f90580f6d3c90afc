//! Ingestion pipeline errors

use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors raised while importing builds
#[derive(Debug, Error)]
pub enum IngestError {
    /// The artifact was malformed; the enclosing transaction rolled back
    #[error(transparent)]
    Parse(#[from] regtrack_junit::ArtifactParseError),

    /// The store rejected the operation
    #[error(transparent)]
    Storage(#[from] regtrack_storage::DatabaseError),

    /// The CI server could not be reached or answered badly
    #[error(transparent)]
    Ci(#[from] regtrack_jenkins::JenkinsError),

    /// The operation was cancelled by shutdown
    #[error("import cancelled")]
    Cancelled,

    /// A worker task died unexpectedly
    #[error("internal ingest failure: {0}")]
    Internal(String),
}
