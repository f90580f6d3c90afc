//! Ingest-facing repository over releases, modules, jobs and test results
//!
//! Single-statement conveniences open their own write session; the
//! `*_tx` methods take an executor so the import service can compose them
//! into one all-or-nothing transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use crate::error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::models::{BuildJob, Module, NewTestResult, Release, TestStatus};
use crate::pool::Database;

/// Column list shared by every release query
const RELEASE_COLUMNS: &str =
    "id, name, jenkins_job_url, git_branch, is_active, last_processed_build, data_version, created_at";

/// Largest number of rows per INSERT statement; keeps the bind-variable
/// count well under the SQLite limit.
const INSERT_CHUNK_ROWS: usize = 500;

fn release_from_row(row: &sqlx::sqlite::SqliteRow) -> Release {
    Release {
        id: row.get("id"),
        name: row.get("name"),
        jenkins_job_url: row.get("jenkins_job_url"),
        git_branch: row.get("git_branch"),
        is_active: row.get("is_active"),
        last_processed_build: row.get("last_processed_build"),
        data_version: row.get("data_version"),
        created_at: row.get("created_at"),
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> BuildJob {
    BuildJob {
        id: row.get("id"),
        module_id: row.get("module_id"),
        job_id: row.get("job_id"),
        parent_job_id: row.get("parent_job_id"),
        jenkins_url: row.get("jenkins_url"),
        version: row.get("version"),
        total: row.get("total"),
        passed: row.get("passed"),
        failed: row.get("failed"),
        skipped: row.get("skipped"),
        error: row.get("error"),
        timestamp: row.get("timestamp"),
        created_at: row.get("created_at"),
    }
}

/// Repository for the release → module → job → test result hierarchy
#[derive(Clone)]
pub struct TrackerStore {
    db: Database,
}

impl TrackerStore {
    /// Create a new repository over the shared database handle
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database handle
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Fetch a release by name
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_release(&self, name: &str) -> DatabaseResult<Option<Release>> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::GetRelease {
            name: name.to_string(),
        })?;

        Ok(row.as_ref().map(release_from_row))
    }

    /// All releases currently flagged active, name-ordered
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_active_releases(&self) -> DatabaseResult<Vec<Release>> {
        let rows = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE is_active = 1 ORDER BY name"
        ))
        .fetch_all(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Query {
            description: "list_active_releases".to_string(),
        })?;

        Ok(rows.iter().map(release_from_row).collect())
    }

    /// Create the release if missing, returning the row either way
    ///
    /// Never deletes; the watermark and data version of an existing row are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn ensure_release(
        &self,
        name: &str,
        jenkins_job_url: Option<&str>,
        git_branch: Option<&str>,
    ) -> DatabaseResult<Release> {
        let mut session = self.db.write().await?;
        let release =
            Self::ensure_release_tx(session.conn(), name, jenkins_job_url, git_branch).await?;
        session.commit().await?;
        Ok(release)
    }

    /// Transactional variant of [`Self::ensure_release`]
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn ensure_release_tx(
        conn: &mut SqliteConnection,
        name: &str,
        jenkins_job_url: Option<&str>,
        git_branch: Option<&str>,
    ) -> DatabaseResult<Release> {
        let operation = DatabaseOperation::EnsureRelease {
            name: name.to_string(),
        };

        let row = sqlx::query(&format!(
            "
            INSERT INTO releases (name, jenkins_job_url, git_branch, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                jenkins_job_url = COALESCE(releases.jenkins_job_url, excluded.jenkins_job_url),
                git_branch = COALESCE(releases.git_branch, excluded.git_branch)
            RETURNING {RELEASE_COLUMNS}
            "
        ))
        .bind(name)
        .bind(jenkins_job_url)
        .bind(git_branch)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_db_err(operation)?;

        Ok(release_from_row(&row))
    }

    /// Flip a release's active flag
    ///
    /// # Errors
    ///
    /// Returns an error if the release does not exist or the update fails.
    pub async fn set_release_active(&self, name: &str, active: bool) -> DatabaseResult<()> {
        let mut session = self.db.write().await?;
        let result = sqlx::query("UPDATE releases SET is_active = ? WHERE name = ?")
            .bind(active)
            .bind(name)
            .execute(session.conn())
            .await
            .map_db_err(DatabaseOperation::Query {
                description: format!("set_release_active '{name}'"),
            })?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                what: format!("release '{name}'"),
            });
        }
        session.commit().await
    }

    /// Advance the release watermark
    ///
    /// Monotonic: a smaller build number than the current watermark is a
    /// no-op rather than a rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn advance_watermark(&self, release_id: i64, build: i64) -> DatabaseResult<()> {
        let mut session = self.db.write().await?;
        Self::advance_watermark_tx(session.conn(), release_id, build).await?;
        session.commit().await
    }

    /// Transactional variant of [`Self::advance_watermark`]
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn advance_watermark_tx(
        conn: &mut SqliteConnection,
        release_id: i64,
        build: i64,
    ) -> DatabaseResult<()> {
        sqlx::query(
            "UPDATE releases SET last_processed_build = ? WHERE id = ? AND last_processed_build < ?",
        )
        .bind(build)
        .bind(release_id)
        .bind(build)
        .execute(conn)
        .await
        .map_db_err(DatabaseOperation::AdvanceWatermark {
            release: release_id.to_string(),
            build,
        })?;

        Ok(())
    }

    /// Bump the release data version used by analytics cache keys
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn bump_data_version_tx(
        conn: &mut SqliteConnection,
        release_id: i64,
    ) -> DatabaseResult<()> {
        sqlx::query("UPDATE releases SET data_version = data_version + 1 WHERE id = ?")
            .bind(release_id)
            .execute(conn)
            .await
            .map_db_err(DatabaseOperation::BumpDataVersion {
                release: release_id.to_string(),
            })?;

        Ok(())
    }

    /// Create the module if missing, returning the row either way
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn ensure_module_tx(
        conn: &mut SqliteConnection,
        release_id: i64,
        name: &str,
    ) -> DatabaseResult<Module> {
        let operation = DatabaseOperation::EnsureModule {
            release: release_id.to_string(),
            module: name.to_string(),
        };

        let row = sqlx::query(
            "
            INSERT INTO modules (release_id, name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (release_id, name) DO UPDATE SET name = excluded.name
            RETURNING id, release_id, name, created_at
            ",
        )
        .bind(release_id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_db_err(operation)?;

        Ok(Module {
            id: row.get("id"),
            release_id: row.get("release_id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    /// Upsert a job row keyed by `(module_id, job_id)`
    ///
    /// Write-through semantics: when the row already exists, NULL
    /// `parent_job_id`, `jenkins_url`, `version` and `timestamp` fields are
    /// filled from the new values; present fields are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_job_tx(
        conn: &mut SqliteConnection,
        module_id: i64,
        job_id: &str,
        parent_job_id: Option<&str>,
        jenkins_url: Option<&str>,
        version: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> DatabaseResult<i64> {
        let operation = DatabaseOperation::UpsertJob {
            module: module_id.to_string(),
            build: job_id.to_string(),
        };

        let row = sqlx::query(
            "
            INSERT INTO jobs (module_id, job_id, parent_job_id, jenkins_url, version, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (module_id, job_id) DO UPDATE SET
                parent_job_id = COALESCE(jobs.parent_job_id, excluded.parent_job_id),
                jenkins_url = COALESCE(jobs.jenkins_url, excluded.jenkins_url),
                version = COALESCE(jobs.version, excluded.version),
                timestamp = COALESCE(jobs.timestamp, excluded.timestamp)
            RETURNING id
            ",
        )
        .bind(module_id)
        .bind(job_id)
        .bind(parent_job_id)
        .bind(jenkins_url)
        .bind(version)
        .bind(timestamp)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_db_err(operation)?;

        Ok(row.get("id"))
    }

    /// Delete all test results of a job ahead of a fresh bulk insert
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_job_results_tx(
        conn: &mut SqliteConnection,
        job_db_id: i64,
    ) -> DatabaseResult<u64> {
        let result = sqlx::query("DELETE FROM test_results WHERE job_id = ?")
            .bind(job_db_id)
            .execute(conn)
            .await
            .map_db_err(DatabaseOperation::Query {
                description: format!("delete results of job {job_db_id}"),
            })?;

        Ok(result.rows_affected())
    }

    /// Bulk-insert one batch of test results for a job
    ///
    /// The batch is chunked internally so the bind-variable count stays
    /// within the SQLite limit.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; the caller's transaction
    /// decides whether that rolls back the whole job.
    pub async fn insert_results_tx(
        conn: &mut SqliteConnection,
        job_db_id: i64,
        results: &[NewTestResult],
    ) -> DatabaseResult<()> {
        let operation = DatabaseOperation::ReplaceTestResults {
            count: results.len(),
        };

        for chunk in results.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO test_results (job_id, test_name, file_path, status, duration_sec, \
                 message, stack_trace, testcase_module, priority, bug) ",
            );

            builder.push_values(chunk, |mut b, result| {
                b.push_bind(job_db_id)
                    .push_bind(&result.test_name)
                    .push_bind(&result.file_path)
                    .push_bind(result.status.as_str())
                    .push_bind(result.duration_sec)
                    .push_bind(&result.message)
                    .push_bind(&result.stack_trace)
                    .push_bind(&result.testcase_module)
                    .push_bind(&result.priority)
                    .push_bind(&result.bug);
            });

            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_db_err(operation.clone())?;
        }

        Ok(())
    }

    /// Recompute a job's status counters from its stored rows
    ///
    /// Returns `(total, passed, failed, skipped, error)` as written.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregate or the update fails.
    pub async fn recompute_job_counts_tx(
        conn: &mut SqliteConnection,
        job_db_id: i64,
    ) -> DatabaseResult<(i64, i64, i64, i64, i64)> {
        let operation = DatabaseOperation::RecomputeCounts { job_db_id };

        let row = sqlx::query(
            "
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'PASSED'), 0) AS passed,
                COALESCE(SUM(status = 'FAILED'), 0) AS failed,
                COALESCE(SUM(status = 'SKIPPED'), 0) AS skipped,
                COALESCE(SUM(status = 'ERROR'), 0) AS error
            FROM test_results
            WHERE job_id = ?
            ",
        )
        .bind(job_db_id)
        .fetch_one(&mut *conn)
        .await
        .map_db_err(operation.clone())?;

        let counts: (i64, i64, i64, i64, i64) = (
            row.get("total"),
            row.get("passed"),
            row.get("failed"),
            row.get("skipped"),
            row.get("error"),
        );

        sqlx::query(
            "UPDATE jobs SET total = ?, passed = ?, failed = ?, skipped = ?, error = ? WHERE id = ?",
        )
        .bind(counts.0)
        .bind(counts.1)
        .bind(counts.2)
        .bind(counts.3)
        .bind(counts.4)
        .bind(job_db_id)
        .execute(conn)
        .await
        .map_db_err(operation)?;

        Ok(counts)
    }

    /// Fetch one job by module and CI build number
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_job(&self, module_id: i64, job_id: &str) -> DatabaseResult<Option<BuildJob>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE module_id = ? AND job_id = ?")
            .bind(module_id)
            .bind(job_id)
            .fetch_optional(self.db.read_pool())
            .await
            .map_db_err(DatabaseOperation::Query {
                description: format!("get_job {job_id} of module {module_id}"),
            })?;

        Ok(row.as_ref().map(job_from_row))
    }

    /// Whether a `(release, module, module_build)` has already been imported
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn is_build_imported(
        &self,
        release_name: &str,
        module_name: &str,
        module_build: &str,
    ) -> DatabaseResult<bool> {
        let row = sqlx::query(
            "
            SELECT COUNT(*) AS count
            FROM jobs j
            JOIN modules m ON m.id = j.module_id
            JOIN releases r ON r.id = m.release_id
            WHERE r.name = ? AND m.name = ? AND j.job_id = ?
            ",
        )
        .bind(release_name)
        .bind(module_name)
        .bind(module_build)
        .fetch_one(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Query {
            description: format!("is_build_imported {release_name}/{module_name}/{module_build}"),
        })?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Test name → effective priority for a release
    ///
    /// Release overrides are layered over the global baseline; only rows
    /// that carry a priority contribute. Works before the release row
    /// exists, in which case only baselines apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn priorities_for_release(
        &self,
        release_name: &str,
    ) -> DatabaseResult<HashMap<String, String>> {
        let rows = sqlx::query(
            "
            SELECT testcase_name, priority, release_id
            FROM testcase_metadata
            WHERE priority IS NOT NULL
              AND (release_id IS NULL
                   OR release_id = (SELECT id FROM releases WHERE name = ?))
            ORDER BY release_id IS NOT NULL
            ",
        )
        .bind(release_name)
        .fetch_all(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Query {
            description: format!("priorities_for_release '{release_name}'"),
        })?;

        // Baselines come first (NULL sorts before non-NULL with the ORDER BY
        // above), so overrides overwrite them in the map.
        let mut priorities = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("testcase_name");
            let priority: String = row.get("priority");
            priorities.insert(name, priority);
        }

        Ok(priorities)
    }

    /// Count results of a job grouped by status, straight from the rows
    ///
    /// Used by tests and consistency checks rather than the hot path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_results_by_status(
        &self,
        job_db_id: i64,
        status: TestStatus,
    ) -> DatabaseResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM test_results WHERE job_id = ? AND status = ?")
            .bind(job_db_id)
            .bind(status.as_str())
            .fetch_one(self.db.read_pool())
            .await
            .map_db_err(DatabaseOperation::Query {
                description: format!("count {status} results of job {job_db_id}"),
            })?;

        Ok(row.get("count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    async fn test_store() -> TrackerStore {
        let db = Database::connect_in_memory().await.expect("connect");
        run_migrations(&db).await.expect("migrate");
        TrackerStore::new(db)
    }

    #[tokio::test]
    async fn test_ensure_release_is_idempotent() {
        let store = test_store().await;

        let first = store
            .ensure_release("6.1.0", Some("https://ci/job/r61"), Some("release-6.1"))
            .await
            .expect("first");
        let second = store
            .ensure_release("6.1.0", None, None)
            .await
            .expect("second");

        assert_eq!(first.id, second.id);
        // NULLs never overwrite existing values
        assert_eq!(second.jenkins_job_url.as_deref(), Some("https://ci/job/r61"));
        assert_eq!(second.last_processed_build, 0);
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let store = test_store().await;
        let release = store.ensure_release("6.1.0", None, None).await.expect("release");

        store.advance_watermark(release.id, 12).await.expect("advance");
        store.advance_watermark(release.id, 11).await.expect("no-op");

        let reloaded = store.get_release("6.1.0").await.expect("get").expect("exists");
        assert_eq!(reloaded.last_processed_build, 12);
    }

    #[tokio::test]
    async fn test_job_upsert_write_through() {
        let store = test_store().await;
        let release = store.ensure_release("6.1.0", None, None).await.expect("release");

        let mut session = store.database().write().await.expect("begin");
        let module = TrackerStore::ensure_module_tx(session.conn(), release.id, "routing")
            .await
            .expect("module");

        let first = TrackerStore::upsert_job_tx(
            session.conn(),
            module.id,
            "451",
            None,
            None,
            None,
            None,
        )
        .await
        .expect("insert");

        let second = TrackerStore::upsert_job_tx(
            session.conn(),
            module.id,
            "451",
            Some("12"),
            Some("https://ci/job/451"),
            Some("6.1.0.3"),
            None,
        )
        .await
        .expect("upsert");
        session.commit().await.expect("commit");

        assert_eq!(first, second);
        let job = store.get_job(module.id, "451").await.expect("get").expect("exists");
        assert_eq!(job.parent_job_id.as_deref(), Some("12"));
        assert_eq!(job.version.as_deref(), Some("6.1.0.3"));
    }

    #[tokio::test]
    async fn test_insert_and_recompute_counts() {
        let store = test_store().await;
        let release = store.ensure_release("6.1.0", None, None).await.expect("release");

        let mut session = store.database().write().await.expect("begin");
        let module = TrackerStore::ensure_module_tx(session.conn(), release.id, "routing")
            .await
            .expect("module");
        let job_db_id = TrackerStore::upsert_job_tx(
            session.conn(),
            module.id,
            "451",
            Some("12"),
            None,
            None,
            None,
        )
        .await
        .expect("job");

        let results = vec![
            NewTestResult {
                test_name: "tests.routing.test_bgp".to_string(),
                file_path: Some("tests/routing/test_bgp.py".to_string()),
                status: TestStatus::Passed,
                duration_sec: Some(1.5),
                message: None,
                stack_trace: None,
                testcase_module: Some("routing".to_string()),
                priority: Some("P1".to_string()),
                bug: None,
            },
            NewTestResult {
                test_name: "tests.routing.test_ospf".to_string(),
                file_path: Some("tests/routing/test_ospf.py".to_string()),
                status: TestStatus::Failed,
                duration_sec: Some(2.0),
                message: Some("assert failed".to_string()),
                stack_trace: Some("at test_ospf.py:10".to_string()),
                testcase_module: Some("routing".to_string()),
                priority: None,
                bug: None,
            },
        ];

        TrackerStore::insert_results_tx(session.conn(), job_db_id, &results)
            .await
            .expect("insert results");
        let counts = TrackerStore::recompute_job_counts_tx(session.conn(), job_db_id)
            .await
            .expect("recompute");
        session.commit().await.expect("commit");

        assert_eq!(counts, (2, 1, 1, 0, 0));
        assert_eq!(
            store
                .count_results_by_status(job_db_id, TestStatus::Failed)
                .await
                .expect("count"),
            1
        );
        assert!(store
            .is_build_imported("6.1.0", "routing", "451")
            .await
            .expect("imported"));
    }
}
