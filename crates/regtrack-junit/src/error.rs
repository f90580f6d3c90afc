//! Artifact parsing errors

use thiserror::Error;

/// Result type alias for parser operations
pub type ParseResult<T> = std::result::Result<T, ArtifactParseError>;

/// Errors raised while reading one artifact
#[derive(Debug, Error)]
pub enum ArtifactParseError {
    /// The XML is not well formed
    ///
    /// Carries the byte offset the reader had reached and a short excerpt
    /// of the surrounding input so the failure can be located in artifacts
    /// that run to several megabytes.
    #[error("malformed XML at byte {offset}: {message} (near '{excerpt}')")]
    Malformed {
        offset: u64,
        message: String,
        excerpt: String,
    },

    /// The underlying reader failed
    #[error("artifact read failed at byte {offset}: {message}")]
    Io { offset: u64, message: String },
}
