//! In-process job tracker
//!
//! A mutex-guarded map plus per-job notified log queues. Suits
//! single-worker deployments; state dies with the process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use regtrack_config::JobTrackerConfig;

use crate::tracker::{
    JobKind, JobResult, JobSnapshot, JobStatus, JobTracker, JobTrackerError, drop_sentinel,
};

struct JobEntry {
    snapshot: JobSnapshot,
    logs: VecDeque<String>,
    /// Lines discarded since the last pop; surfaced as one sentinel
    pending_dropped: u64,
    logs_touched_at: DateTime<Utc>,
    notify: Arc<Notify>,
}

/// Tracker backed by an in-process map
pub struct MemoryJobTracker {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    config: JobTrackerConfig,
}

impl MemoryJobTracker {
    /// Create an empty tracker
    pub fn new(config: JobTrackerConfig) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            config,
        }
    }
}

#[async_trait]
impl JobTracker for MemoryJobTracker {
    async fn create(&self, kind: JobKind) -> JobResult<Uuid> {
        let id = Uuid::new_v4();
        let entry = JobEntry {
            snapshot: JobSnapshot {
                id,
                kind,
                status: JobStatus::Pending,
                error: None,
                result: None,
                started_at: Utc::now(),
                completed_at: None,
            },
            logs: VecDeque::new(),
            pending_dropped: 0,
            logs_touched_at: Utc::now(),
            notify: Arc::new(Notify::new()),
        };

        self.jobs.lock().await.insert(id, entry);
        Ok(id)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(&job_id).ok_or(JobTrackerError::NotFound(job_id))?;

        entry.snapshot.status = status;
        if error.is_some() {
            entry.snapshot.error = error;
        }
        if result.is_some() {
            entry.snapshot.result = result;
        }
        if status.is_terminal() {
            entry.snapshot.completed_at = Some(Utc::now());
        }
        // Wake a blocked pop so a finished job doesn't leave the streamer
        // hanging for the full timeout.
        entry.notify.notify_waiters();
        Ok(())
    }

    async fn push_log(&self, job_id: Uuid, line: &str) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(&job_id).ok_or(JobTrackerError::NotFound(job_id))?;

        if entry.logs.len() >= self.config.log_queue_capacity {
            entry.logs.pop_front();
            entry.pending_dropped = entry.pending_dropped.saturating_add(1);
        }
        entry.logs.push_back(line.to_string());
        entry.logs_touched_at = Utc::now();
        entry.notify.notify_one();
        Ok(())
    }

    async fn pop_log(&self, job_id: Uuid, timeout: Duration) -> JobResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = {
                let mut jobs = self.jobs.lock().await;
                let entry = jobs.get_mut(&job_id).ok_or(JobTrackerError::NotFound(job_id))?;

                if entry.pending_dropped > 0 {
                    let sentinel = drop_sentinel(entry.pending_dropped);
                    entry.pending_dropped = 0;
                    return Ok(Some(sentinel));
                }
                if let Some(line) = entry.logs.pop_front() {
                    return Ok(Some(line));
                }
                Arc::clone(&entry.notify)
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobSnapshot>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(&job_id).map(|e| e.snapshot.clone()))
    }

    async fn sweep_expired(&self) -> JobResult<u64> {
        let job_cutoff = Utc::now() - chrono::Duration::hours(self.config.job_ttl_hours as i64);
        let log_cutoff = Utc::now() - chrono::Duration::hours(self.config.log_ttl_hours as i64);

        let mut jobs = self.jobs.lock().await;
        let before = jobs.len() as u64;
        jobs.retain(|_, entry| entry.snapshot.started_at >= job_cutoff);

        for entry in jobs.values_mut() {
            if entry.logs_touched_at < log_cutoff && !entry.logs.is_empty() {
                entry.logs.clear();
                entry.pending_dropped = 0;
            }
        }

        Ok(before.saturating_sub(jobs.len() as u64))
    }

    async fn fail_inflight(&self, reason: &str) -> JobResult<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut failed = 0u64;

        for entry in jobs.values_mut() {
            if !entry.snapshot.status.is_terminal() {
                entry.snapshot.status = JobStatus::Failed;
                entry.snapshot.error = Some(reason.to_string());
                entry.snapshot.completed_at = Some(Utc::now());
                entry.notify.notify_waiters();
                failed = failed.saturating_add(1);
            }
        }

        Ok(failed)
    }
}
