//! Shared tracking of background job state and per-job log queues

pub mod database;
pub mod memory;
pub mod tracker;
pub mod worker;

use std::sync::Arc;

use regtrack_config::{JobTrackerBackend, JobTrackerConfig};
use regtrack_storage::Database;

pub use database::DbJobTracker;
pub use memory::MemoryJobTracker;
pub use tracker::{JobKind, JobResult, JobSnapshot, JobStatus, JobTracker, JobTrackerError};
pub use worker::{TaskFuture, WorkerPool};

/// Build the tracker selected by configuration
pub fn build_tracker(config: JobTrackerConfig, db: Database) -> Arc<dyn JobTracker> {
    match config.backend {
        JobTrackerBackend::Memory => Arc::new(MemoryJobTracker::new(config)),
        JobTrackerBackend::Database => Arc::new(DbJobTracker::new(db, config)),
    }
}
