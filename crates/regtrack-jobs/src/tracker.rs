//! Background job tracking contract
//!
//! A tracker owns all `BackgroundJob` state and a bounded per-job log
//! queue. Request handlers create jobs, workers write to them, and status
//! plus streaming endpoints read snapshots and pop log lines. Everything
//! else in the system only ever sees point-in-time snapshots.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for tracker operations
pub type JobResult<T> = std::result::Result<T, JobTrackerError>;

/// Errors surfaced by a job tracker
#[derive(Debug, Error)]
pub enum JobTrackerError {
    /// The job id is unknown (or already expired)
    #[error("unknown job {0}")]
    NotFound(Uuid),

    /// The backing store failed
    #[error(transparent)]
    Storage(#[from] regtrack_storage::DatabaseError),
}

/// What kind of work a background job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Import,
    MetadataSync,
    BugUpdate,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::MetadataSync => "metadata_sync",
            Self::BugUpdate => "bug_update",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(Self::Import),
            "metadata_sync" => Ok(Self::MetadataSync),
            "bug_update" => Ok(Self::BugUpdate),
            _ => Err(format!("Invalid job kind: {s}")),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached a final state
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of one background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Shared tracker for background job state and streaming logs
///
/// Implementations: an in-process map for single-worker deployments and a
/// database-backed variant whose rows are visible to every worker process
/// and survive restarts. The contract is identical; selection is a startup
/// choice.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Create a job in `pending` state, returning its random UUID
    async fn create(&self, kind: JobKind) -> JobResult<Uuid>;

    /// Atomically update a job's status, with optional error and result
    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> JobResult<()>;

    /// Append a line to the job's bounded log queue
    ///
    /// On overflow the oldest line is dropped and a `…(n lines dropped)`
    /// sentinel takes its place in the stream.
    async fn push_log(&self, job_id: Uuid, line: &str) -> JobResult<()>;

    /// Pop the oldest log line, blocking up to `timeout`
    ///
    /// Returns `None` when the timeout elapses with no line available.
    async fn pop_log(&self, job_id: Uuid, timeout: Duration) -> JobResult<Option<String>>;

    /// Point-in-time snapshot of one job
    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobSnapshot>>;

    /// Drop jobs past the state TTL and logs past the log TTL
    ///
    /// Returns the number of jobs removed.
    async fn sweep_expired(&self) -> JobResult<u64>;

    /// Mark every non-terminal job failed with the given reason
    ///
    /// Used on graceful-shutdown expiry.
    async fn fail_inflight(&self, reason: &str) -> JobResult<u64>;
}

/// Render the overflow sentinel for `n` dropped lines
pub(crate) fn drop_sentinel(n: u64) -> String {
    format!("…({n} lines dropped)")
}
