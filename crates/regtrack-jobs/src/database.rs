//! Database-backed job tracker
//!
//! Job state and log queues live in the shared store, so every worker
//! process sees the same jobs and a restart loses nothing. Log pops poll;
//! there is no cross-process wakeup.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use regtrack_config::JobTrackerConfig;
use regtrack_storage::{Database, DatabaseErrorExt, DatabaseOperation};

use crate::tracker::{
    JobKind, JobResult, JobSnapshot, JobStatus, JobTracker, JobTrackerError, drop_sentinel,
};

/// How often a blocked pop re-checks the queue
const POP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tracker backed by `background_jobs` / `background_job_logs`
pub struct DbJobTracker {
    db: Database,
    config: JobTrackerConfig,
}

impl DbJobTracker {
    /// Create a tracker over the shared database handle
    pub const fn new(db: Database, config: JobTrackerConfig) -> Self {
        Self { db, config }
    }

    fn op(description: &str) -> DatabaseOperation {
        DatabaseOperation::Query {
            description: description.to_string(),
        }
    }

    async fn try_pop(&self, job_id: Uuid) -> JobResult<Option<String>> {
        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;

        let row = sqlx::query(
            "SELECT id, line FROM background_job_logs WHERE job_id = ? ORDER BY seq LIMIT 1",
        )
        .bind(job_id.to_string())
        .fetch_optional(session.conn())
        .await
        .map_db_err(Self::op("pop_log select"))
        .map_err(JobTrackerError::Storage)?;

        let Some(row) = row else {
            session.rollback().await.map_err(JobTrackerError::Storage)?;
            return Ok(None);
        };

        let row_id: i64 = row.get("id");
        let line: String = row.get("line");

        sqlx::query("DELETE FROM background_job_logs WHERE id = ?")
            .bind(row_id)
            .execute(session.conn())
            .await
            .map_db_err(Self::op("pop_log delete"))
            .map_err(JobTrackerError::Storage)?;

        session.commit().await.map_err(JobTrackerError::Storage)?;
        Ok(Some(line))
    }
}

#[async_trait]
impl JobTracker for DbJobTracker {
    async fn create(&self, kind: JobKind) -> JobResult<Uuid> {
        let id = Uuid::new_v4();

        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;
        sqlx::query(
            "INSERT INTO background_jobs (id, kind, status, started_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(Utc::now())
        .execute(session.conn())
        .await
        .map_db_err(Self::op("create job"))
        .map_err(JobTrackerError::Storage)?;
        session.commit().await.map_err(JobTrackerError::Storage)?;

        Ok(id)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> JobResult<()> {
        let completed_at = status.is_terminal().then(Utc::now);
        let result_text = result.map(|v| v.to_string());

        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;
        let outcome = sqlx::query(
            "
            UPDATE background_jobs SET
                status = ?,
                error = COALESCE(?, error),
                result = COALESCE(?, result),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(result_text)
        .bind(completed_at)
        .bind(job_id.to_string())
        .execute(session.conn())
        .await
        .map_db_err(Self::op("set_status"))
        .map_err(JobTrackerError::Storage)?;

        if outcome.rows_affected() == 0 {
            session.rollback().await.map_err(JobTrackerError::Storage)?;
            return Err(JobTrackerError::NotFound(job_id));
        }
        session.commit().await.map_err(JobTrackerError::Storage)?;
        Ok(())
    }

    async fn push_log(&self, job_id: Uuid, line: &str) -> JobResult<()> {
        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;
        let id_text = job_id.to_string();

        let exists: i64 = sqlx::query("SELECT COUNT(*) AS c FROM background_jobs WHERE id = ?")
            .bind(&id_text)
            .fetch_one(session.conn())
            .await
            .map_db_err(Self::op("push_log exists"))
            .map_err(JobTrackerError::Storage)?
            .get("c");
        if exists == 0 {
            session.rollback().await.map_err(JobTrackerError::Storage)?;
            return Err(JobTrackerError::NotFound(job_id));
        }

        sqlx::query(
            "
            INSERT INTO background_job_logs (job_id, seq, line, created_at)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), -1) + 1 FROM background_job_logs WHERE job_id = ?),
                ?,
                ?
            )
            ",
        )
        .bind(&id_text)
        .bind(&id_text)
        .bind(line)
        .bind(Utc::now())
        .execute(session.conn())
        .await
        .map_db_err(Self::op("push_log insert"))
        .map_err(JobTrackerError::Storage)?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM background_job_logs WHERE job_id = ?")
            .bind(&id_text)
            .fetch_one(session.conn())
            .await
            .map_db_err(Self::op("push_log count"))
            .map_err(JobTrackerError::Storage)?
            .get("c");

        let capacity = self.config.log_queue_capacity as i64;
        if count > capacity {
            let excess = count - capacity;
            sqlx::query(
                "
                DELETE FROM background_job_logs
                WHERE id IN (
                    SELECT id FROM background_job_logs WHERE job_id = ? ORDER BY seq LIMIT ?
                )
                ",
            )
            .bind(&id_text)
            .bind(excess)
            .execute(session.conn())
            .await
            .map_db_err(Self::op("push_log trim"))
            .map_err(JobTrackerError::Storage)?;

            // Sentinel slots in ahead of the oldest surviving line
            sqlx::query(
                "
                INSERT INTO background_job_logs (job_id, seq, line, created_at)
                VALUES (
                    ?,
                    (SELECT COALESCE(MIN(seq), 0) - 1 FROM background_job_logs WHERE job_id = ?),
                    ?,
                    ?
                )
                ",
            )
            .bind(&id_text)
            .bind(&id_text)
            .bind(drop_sentinel(excess as u64))
            .bind(Utc::now())
            .execute(session.conn())
            .await
            .map_db_err(Self::op("push_log sentinel"))
            .map_err(JobTrackerError::Storage)?;
        }

        session.commit().await.map_err(JobTrackerError::Storage)?;
        Ok(())
    }

    async fn pop_log(&self, job_id: Uuid, timeout: Duration) -> JobResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(line) = self.try_pop(job_id).await? {
                return Ok(Some(line));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POP_POLL_INTERVAL)).await;
        }
    }

    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobSnapshot>> {
        let row = sqlx::query("SELECT * FROM background_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(self.db.read_pool())
            .await
            .map_db_err(Self::op("get job"))
            .map_err(JobTrackerError::Storage)?;

        Ok(row.map(|row| {
            let kind: String = row.get("kind");
            let status: String = row.get("status");
            let result: Option<String> = row.get("result");
            JobSnapshot {
                id: job_id,
                kind: kind.parse().unwrap_or(JobKind::Import),
                status: status.parse().unwrap_or(JobStatus::Failed),
                error: row.get("error"),
                result: result.and_then(|r| serde_json::from_str(&r).ok()),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
            }
        }))
    }

    async fn sweep_expired(&self) -> JobResult<u64> {
        let job_cutoff = Utc::now() - chrono::Duration::hours(self.config.job_ttl_hours as i64);
        let log_cutoff = Utc::now() - chrono::Duration::hours(self.config.log_ttl_hours as i64);

        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;

        let removed = sqlx::query("DELETE FROM background_jobs WHERE started_at < ?")
            .bind(job_cutoff)
            .execute(session.conn())
            .await
            .map_db_err(Self::op("sweep jobs"))
            .map_err(JobTrackerError::Storage)?
            .rows_affected();

        sqlx::query("DELETE FROM background_job_logs WHERE created_at < ?")
            .bind(log_cutoff)
            .execute(session.conn())
            .await
            .map_db_err(Self::op("sweep logs"))
            .map_err(JobTrackerError::Storage)?;

        session.commit().await.map_err(JobTrackerError::Storage)?;
        Ok(removed)
    }

    async fn fail_inflight(&self, reason: &str) -> JobResult<u64> {
        let mut session = self.db.write().await.map_err(JobTrackerError::Storage)?;

        let failed = sqlx::query(
            "
            UPDATE background_jobs
            SET status = 'failed', error = ?, completed_at = ?
            WHERE status IN ('pending', 'running')
            ",
        )
        .bind(reason)
        .bind(Utc::now())
        .execute(session.conn())
        .await
        .map_db_err(Self::op("fail_inflight"))
        .map_err(JobTrackerError::Storage)?
        .rows_affected();

        session.commit().await.map_err(JobTrackerError::Storage)?;
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtrack_config::JobTrackerBackend;
    use regtrack_storage::run_migrations;

    async fn test_tracker(capacity: usize) -> DbJobTracker {
        let db = Database::connect_in_memory().await.expect("connect");
        run_migrations(&db).await.expect("migrate");
        DbJobTracker::new(
            db,
            JobTrackerConfig {
                backend: JobTrackerBackend::Database,
                worker_count: 2,
                job_ttl_hours: 24,
                log_ttl_hours: 1,
                log_queue_capacity: capacity,
            },
        )
    }

    #[tokio::test]
    async fn test_lifecycle_survives_in_rows() {
        let tracker = test_tracker(16).await;
        let id = tracker.create(JobKind::MetadataSync).await.expect("create");

        tracker
            .set_status(id, JobStatus::Running, None, None)
            .await
            .expect("running");
        tracker
            .set_status(id, JobStatus::Failed, Some("boom".to_string()), None)
            .await
            .expect("failed");

        let snapshot = tracker.get(id).await.expect("get").expect("exists");
        assert_eq!(snapshot.kind, JobKind::MetadataSync);
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_log_fifo_and_overflow() {
        let tracker = test_tracker(3).await;
        let id = tracker.create(JobKind::Import).await.expect("create");

        for i in 0..5 {
            tracker.push_log(id, &format!("line {i}")).await.expect("push");
        }

        // Sentinel for the dropped prefix, then the survivors in order
        let first = tracker
            .pop_log(id, Duration::from_millis(10))
            .await
            .expect("pop")
            .expect("line");
        assert!(first.contains("lines dropped"), "got '{first}'");

        let second = tracker
            .pop_log(id, Duration::from_millis(10))
            .await
            .expect("pop")
            .expect("line");
        assert!(second.starts_with("line"));
    }

    #[tokio::test]
    async fn test_set_status_unknown_job() {
        let tracker = test_tracker(16).await;
        let err = tracker
            .set_status(Uuid::new_v4(), JobStatus::Running, None, None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, JobTrackerError::NotFound(_)));
    }
}
