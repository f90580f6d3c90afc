//! Admin façade consumed by the HTTP shell
//!
//! Trigger endpoints return a job id immediately; the work itself runs on
//! the background pool and reports through the job tracker. Manual
//! triggers are guarded by check-and-set in-progress flags so concurrent
//! submissions collide loudly instead of racing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use regtrack_ingest::Scheduler;
use regtrack_jobs::{JobKind, JobSnapshot, JobStatus, JobTracker, WorkerPool};
use regtrack_metadata::MetadataSync;
use regtrack_storage::{MetadataStore, MetadataSyncLog, TrackerStore};

/// Errors surfaced by admin operations
#[derive(Debug, Error)]
pub enum AdminError {
    /// Another trigger of the same kind is still running
    #[error("{0} already in progress")]
    Conflict(&'static str),

    /// The addressed release or job does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The worker pool rejected the task (shutdown in progress)
    #[error("background workers unavailable")]
    Unavailable,

    /// Tracker or storage failure
    #[error("internal failure: {0}")]
    Internal(String),
}

/// Clears an in-progress flag when the guarded task finishes
struct FlagGuard(Arc<AtomicBool>);

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Admin operations wired over the shared services
pub struct AdminService {
    store: TrackerStore,
    metadata_store: MetadataStore,
    tracker: Arc<dyn JobTracker>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    metadata_sync: Arc<MetadataSync>,
    cancel: CancellationToken,
    import_in_progress: Arc<AtomicBool>,
    sync_in_progress: Arc<AtomicBool>,
}

impl AdminService {
    /// Wire the façade over the shared services
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TrackerStore,
        metadata_store: MetadataStore,
        tracker: Arc<dyn JobTracker>,
        pool: Arc<WorkerPool>,
        scheduler: Arc<Scheduler>,
        metadata_sync: Arc<MetadataSync>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            metadata_store,
            tracker,
            pool,
            scheduler,
            metadata_sync,
            cancel,
            import_in_progress: Arc::new(AtomicBool::new(false)),
            sync_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kick off a manual import pass for one release
    ///
    /// Returns the tracker job id; progress and failure surface through
    /// the job snapshot and the log stream.
    ///
    /// # Errors
    ///
    /// `Conflict` when an import trigger is already running, `NotFound`
    /// for an unknown release, `Unavailable` during shutdown.
    pub async fn trigger_import(&self, release_name: &str) -> Result<Uuid, AdminError> {
        let release = self
            .store
            .get_release(release_name)
            .await
            .map_err(|e| AdminError::Internal(e.to_string()))?
            .ok_or_else(|| AdminError::NotFound(format!("release '{release_name}'")))?;

        if self.import_in_progress.swap(true, Ordering::SeqCst) {
            return Err(AdminError::Conflict("import"));
        }
        let guard = FlagGuard(Arc::clone(&self.import_in_progress));

        let job_id = self
            .tracker
            .create(JobKind::Import)
            .await
            .map_err(|e| AdminError::Internal(e.to_string()))?;

        let tracker = Arc::clone(&self.tracker);
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.child_token();

        let task = Box::pin(async move {
            let _guard = guard;
            let _ = tracker.set_status(job_id, JobStatus::Running, None, None).await;
            let _ = tracker
                .push_log(job_id, &format!("import pass for {} starting", release.name))
                .await;

            match scheduler.poll_release(&release, &cancel).await {
                Ok(outcome) => {
                    let _ = tracker
                        .push_log(
                            job_id,
                            &format!(
                                "imported {} modules across {} builds ({} failed), watermark {}",
                                outcome.modules_imported,
                                outcome.builds_completed,
                                outcome.modules_failed,
                                outcome.watermark
                            ),
                        )
                        .await;
                    let result = serde_json::json!({
                        "builds_completed": outcome.builds_completed,
                        "modules_imported": outcome.modules_imported,
                        "modules_failed": outcome.modules_failed,
                        "watermark": outcome.watermark,
                    });
                    let _ = tracker
                        .set_status(job_id, JobStatus::Completed, None, Some(result))
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "manual import failed");
                    let _ = tracker
                        .set_status(job_id, JobStatus::Failed, Some(e.to_string()), None)
                        .await;
                }
            }
        });

        if self.pool.submit(task).await {
            info!(%job_id, release = release_name, "import queued");
            Ok(job_id)
        } else {
            Err(AdminError::Unavailable)
        }
    }

    /// Kick off a metadata sync for one release or all active ones
    ///
    /// # Errors
    ///
    /// `Conflict` when a sync trigger is already running, `Unavailable`
    /// during shutdown.
    pub async fn trigger_metadata_sync(
        &self,
        release_name: Option<&str>,
    ) -> Result<Uuid, AdminError> {
        if self.sync_in_progress.swap(true, Ordering::SeqCst) {
            return Err(AdminError::Conflict("metadata sync"));
        }
        let guard = FlagGuard(Arc::clone(&self.sync_in_progress));

        let job_id = self
            .tracker
            .create(JobKind::MetadataSync)
            .await
            .map_err(|e| AdminError::Internal(e.to_string()))?;

        let tracker = Arc::clone(&self.tracker);
        let sync = Arc::clone(&self.metadata_sync);
        let cancel = self.cancel.child_token();
        let release = release_name.map(str::to_string);

        let task = Box::pin(async move {
            let _guard = guard;
            let _ = tracker.set_status(job_id, JobStatus::Running, None, None).await;

            let progress_tracker = Arc::clone(&tracker);
            let progress = move |line: &str| {
                let tracker = Arc::clone(&progress_tracker);
                let line = line.to_string();
                tokio::spawn(async move {
                    let _ = tracker.push_log(job_id, &line).await;
                });
            };

            let result = match release.as_deref() {
                Some(name) => sync.sync(Some(name), &progress, &cancel).await.map(|o| vec![o]),
                None => sync.sync_all_active(&progress, &cancel).await,
            };

            match result {
                Ok(outcomes) => {
                    let upserted: u64 = outcomes.iter().map(|o| o.tests_upserted).sum();
                    let scanned: u64 = outcomes.iter().map(|o| o.files_scanned).sum();
                    let result = serde_json::json!({
                        "runs": outcomes.len(),
                        "files_scanned": scanned,
                        "tests_upserted": upserted,
                    });
                    let _ = tracker
                        .set_status(job_id, JobStatus::Completed, None, Some(result))
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "metadata sync failed");
                    let _ = tracker
                        .set_status(job_id, JobStatus::Failed, Some(e.to_string()), None)
                        .await;
                }
            }
        });

        if self.pool.submit(task).await {
            info!(%job_id, "metadata sync queued");
            Ok(job_id)
        } else {
            Err(AdminError::Unavailable)
        }
    }

    /// Point-in-time snapshot of a background job
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or expired job id.
    pub async fn job_snapshot(&self, job_id: Uuid) -> Result<JobSnapshot, AdminError> {
        self.tracker
            .get(job_id)
            .await
            .map_err(|e| AdminError::Internal(e.to_string()))?
            .ok_or_else(|| AdminError::NotFound(format!("job {job_id}")))
    }

    /// Pop the next log line for the SSE stream, blocking up to `timeout`
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown job id.
    pub async fn next_log_line(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<String>, AdminError> {
        match self.tracker.pop_log(job_id, timeout).await {
            Ok(line) => Ok(line),
            Err(regtrack_jobs::JobTrackerError::NotFound(id)) => {
                Err(AdminError::NotFound(format!("job {id}")))
            }
            Err(e) => Err(AdminError::Internal(e.to_string())),
        }
    }

    /// Recent metadata sync runs, newest first
    ///
    /// # Errors
    ///
    /// `Internal` when the store read fails.
    pub async fn metadata_sync_history(
        &self,
        limit: i64,
    ) -> Result<Vec<MetadataSyncLog>, AdminError> {
        self.metadata_store
            .recent_sync_logs(limit)
            .await
            .map_err(|e| AdminError::Internal(e.to_string()))
    }
}
