//! regtrack storage layer over the embedded SQLite store
//!
//! Owns persistence of the release → module → job → test result hierarchy
//! plus curated testcase metadata and sync logs. WAL journaling, enforced
//! foreign keys, a bounded read pool and a single-permit write path.

// Module declarations
pub mod error;
pub mod metadata_store;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod repository;

// Public exports
pub use error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
pub use metadata_store::{MetadataStore, UpsertOutcome};
pub use migrations::{needs_migration, run_migrations};
pub use models::{
    BuildJob, MetadataContent, MetadataSyncLog, Module, NewTestResult, Release, SyncFileError,
    SyncStatus, TestResult, TestStatus, TestState, TestcaseMetadata,
};
pub use pool::{Database, WriteSession};
pub use repository::TrackerStore;
