//! Analytics errors
//!
//! `NotFound` maps to 404 at the HTTP shell, `BadRequest` to 4xx; storage
//! failures bubble as 5xx. Errors always bypass the cache.

use thiserror::Error;

/// Result type alias for analytics operations
pub type AnalyticsResult<T> = std::result::Result<T, AnalyticsError>;

/// Errors surfaced by the analytics engine
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// The addressed release, module or job does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A request parameter is out of range or malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The store rejected a query
    #[error(transparent)]
    Storage(#[from] regtrack_storage::DatabaseError),
}
