//! Structured error handling for the storage layer
//!
//! Provides error types with full context for database operations,
//! migration failures, and transaction discipline violations.

use std::fmt;
use thiserror::Error;

/// Result type alias for database operations
pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Database operation type for error context
#[derive(Debug, Clone)]
pub enum DatabaseOperation {
    /// Release operations
    EnsureRelease { name: String },
    GetRelease { name: String },
    AdvanceWatermark { release: String, build: i64 },
    BumpDataVersion { release: String },

    /// Module / job operations
    EnsureModule { release: String, module: String },
    UpsertJob { module: String, build: String },
    ReplaceTestResults { count: usize },
    RecomputeCounts { job_db_id: i64 },

    /// Metadata operations
    UpsertMetadata { testcase: String },
    DeleteOverride { testcase: String },
    RecordSyncLog,

    /// Generic operations
    Query { description: String },
    Transaction { description: String },
    Migration { version: i32 },
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnsureRelease { name } => write!(f, "ensure release '{name}'"),
            Self::GetRelease { name } => write!(f, "get release '{name}'"),
            Self::AdvanceWatermark { release, build } => {
                write!(f, "advance watermark of '{release}' to {build}")
            }
            Self::BumpDataVersion { release } => write!(f, "bump data version of '{release}'"),
            Self::EnsureModule { release, module } => {
                write!(f, "ensure module '{module}' of '{release}'")
            }
            Self::UpsertJob { module, build } => write!(f, "upsert job {build} of '{module}'"),
            Self::ReplaceTestResults { count } => write!(f, "replace {count} test results"),
            Self::RecomputeCounts { job_db_id } => write!(f, "recompute counts of job {job_db_id}"),
            Self::UpsertMetadata { testcase } => write!(f, "upsert metadata for '{testcase}'"),
            Self::DeleteOverride { testcase } => write!(f, "delete override for '{testcase}'"),
            Self::RecordSyncLog => write!(f, "record metadata sync log"),
            Self::Query { description } => write!(f, "query: {description}"),
            Self::Transaction { description } => write!(f, "transaction: {description}"),
            Self::Migration { version } => write!(f, "migration {version}"),
        }
    }
}

/// Errors surfaced by the storage layer
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A query or statement failed
    #[error("Database operation failed ({operation}): {source}")]
    QueryFailed {
        operation: Box<DatabaseOperation>,
        #[source]
        source: sqlx::Error,
    },

    /// The pool could not be created or a connection acquired
    #[error("Database connection failed: {message}")]
    ConnectionFailed { message: String },

    /// A migration could not be applied
    #[error("Migration {version} failed: {message}")]
    MigrationFailed { version: i32, message: String },

    /// A row that must exist is missing
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Stored data violates an invariant the code relies on
    #[error("Data integrity violation ({operation}): {message}")]
    DataIntegrity {
        operation: Box<DatabaseOperation>,
        message: String,
    },
}

/// Extension trait to attach operation context to sqlx errors
pub trait DatabaseErrorExt<T> {
    /// Map a raw sqlx error into a contextualized `DatabaseError`
    fn map_db_err(self, operation: DatabaseOperation) -> DatabaseResult<T>;
}

impl<T> DatabaseErrorExt<T> for std::result::Result<T, sqlx::Error> {
    fn map_db_err(self, operation: DatabaseOperation) -> DatabaseResult<T> {
        self.map_err(|source| DatabaseError::QueryFailed {
            operation: Box::new(operation),
            source,
        })
    }
}
