//! Persistence for curated testcase metadata and sync run logs
//!
//! Baseline rows (`release_id` NULL) apply to every release; an override
//! row exists only while its content differs from the baseline. The
//! synchronizer drives these methods in batches inside write sessions.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};

use crate::error::{DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::models::{
    MetadataContent, MetadataSyncLog, SyncFileError, SyncStatus, TestcaseMetadata,
};
use crate::pool::Database;

/// Outcome of applying one discovered testcase to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created
    Inserted,
    /// An existing row's content changed
    Updated,
    /// Stored content already matched
    Unchanged,
    /// A release override matched the baseline again and was pruned
    OverridePruned,
}

fn metadata_from_row(row: &sqlx::sqlite::SqliteRow) -> TestcaseMetadata {
    let state: String = row.get("test_state");
    TestcaseMetadata {
        id: row.get("id"),
        testcase_name: row.get("testcase_name"),
        release_id: row.get("release_id"),
        test_class_name: row.get("test_class_name"),
        module: row.get("module"),
        topology: row.get("topology"),
        test_state: state.parse().unwrap_or(crate::models::TestState::Prod),
        test_case_id: row.get("test_case_id"),
        testrail_id: row.get("testrail_id"),
        priority: row.get("priority"),
        test_path: row.get("test_path"),
        updated_at: row.get("updated_at"),
    }
}

/// Repository for testcase metadata and sync logs
#[derive(Clone)]
pub struct MetadataStore {
    db: Database,
}

impl MetadataStore {
    /// Create a new store over the shared database handle
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database handle
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Fetch one metadata row by identity
    ///
    /// `release_id = None` addresses the baseline row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(
        &self,
        testcase_name: &str,
        release_id: Option<i64>,
    ) -> DatabaseResult<Option<TestcaseMetadata>> {
        let row = sqlx::query(
            "
            SELECT * FROM testcase_metadata
            WHERE testcase_name = ? AND COALESCE(release_id, -1) = COALESCE(?, -1)
            ",
        )
        .bind(testcase_name)
        .bind(release_id)
        .fetch_optional(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Query {
            description: format!("get metadata '{testcase_name}'"),
        })?;

        Ok(row.as_ref().map(metadata_from_row))
    }

    /// Apply one discovered testcase inside an open transaction
    ///
    /// Baseline target (`release_id = None`): insert when absent, update
    /// when content differs, otherwise report unchanged. Release target:
    /// when the discovered content equals the baseline, any existing
    /// override is pruned; otherwise the override is inserted or updated.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the caller's batch
    /// transaction decides what rolls back.
    pub async fn apply_discovered_tx(
        conn: &mut SqliteConnection,
        testcase_name: &str,
        release_id: Option<i64>,
        discovered: &MetadataContent,
    ) -> DatabaseResult<UpsertOutcome> {
        let baseline = Self::fetch_tx(conn, testcase_name, None).await?;

        match release_id {
            None => match baseline {
                None => {
                    Self::insert_tx(conn, testcase_name, None, discovered).await?;
                    Ok(UpsertOutcome::Inserted)
                }
                Some(existing) if existing.content() == *discovered => Ok(UpsertOutcome::Unchanged),
                Some(existing) => {
                    Self::update_tx(conn, existing.id, discovered).await?;
                    Ok(UpsertOutcome::Updated)
                }
            },
            Some(rid) => {
                let Some(baseline) = baseline else {
                    // No baseline yet: the discovered values become the
                    // baseline rather than an orphan override.
                    Self::insert_tx(conn, testcase_name, None, discovered).await?;
                    return Ok(UpsertOutcome::Inserted);
                };

                let existing_override = Self::fetch_tx(conn, testcase_name, Some(rid)).await?;

                if baseline.content() == *discovered {
                    return match existing_override {
                        Some(row) => {
                            Self::delete_tx(conn, row.id, testcase_name).await?;
                            Ok(UpsertOutcome::OverridePruned)
                        }
                        None => Ok(UpsertOutcome::Unchanged),
                    };
                }

                match existing_override {
                    None => {
                        Self::insert_tx(conn, testcase_name, Some(rid), discovered).await?;
                        Ok(UpsertOutcome::Inserted)
                    }
                    Some(row) if row.content() == *discovered => Ok(UpsertOutcome::Unchanged),
                    Some(row) => {
                        Self::update_tx(conn, row.id, discovered).await?;
                        Ok(UpsertOutcome::Updated)
                    }
                }
            }
        }
    }

    async fn fetch_tx(
        conn: &mut SqliteConnection,
        testcase_name: &str,
        release_id: Option<i64>,
    ) -> DatabaseResult<Option<TestcaseMetadata>> {
        let row = sqlx::query(
            "
            SELECT * FROM testcase_metadata
            WHERE testcase_name = ? AND COALESCE(release_id, -1) = COALESCE(?, -1)
            ",
        )
        .bind(testcase_name)
        .bind(release_id)
        .fetch_optional(conn)
        .await
        .map_db_err(DatabaseOperation::Query {
            description: format!("fetch metadata '{testcase_name}'"),
        })?;

        Ok(row.as_ref().map(metadata_from_row))
    }

    async fn insert_tx(
        conn: &mut SqliteConnection,
        testcase_name: &str,
        release_id: Option<i64>,
        content: &MetadataContent,
    ) -> DatabaseResult<()> {
        sqlx::query(
            "
            INSERT INTO testcase_metadata (
                testcase_name, release_id, test_class_name, module, topology,
                test_state, test_case_id, testrail_id, priority, test_path, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(testcase_name)
        .bind(release_id)
        .bind(&content.test_class_name)
        .bind(&content.module)
        .bind(&content.topology)
        .bind(content.test_state.as_str())
        .bind(&content.test_case_id)
        .bind(&content.testrail_id)
        .bind(&content.priority)
        .bind(&content.test_path)
        .bind(Utc::now())
        .execute(conn)
        .await
        .map_db_err(DatabaseOperation::UpsertMetadata {
            testcase: testcase_name.to_string(),
        })?;

        Ok(())
    }

    async fn update_tx(
        conn: &mut SqliteConnection,
        row_id: i64,
        content: &MetadataContent,
    ) -> DatabaseResult<()> {
        sqlx::query(
            "
            UPDATE testcase_metadata SET
                test_class_name = ?, module = ?, topology = ?, test_state = ?,
                test_case_id = ?, testrail_id = ?, priority = ?, test_path = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&content.test_class_name)
        .bind(&content.module)
        .bind(&content.topology)
        .bind(content.test_state.as_str())
        .bind(&content.test_case_id)
        .bind(&content.testrail_id)
        .bind(&content.priority)
        .bind(&content.test_path)
        .bind(Utc::now())
        .bind(row_id)
        .execute(conn)
        .await
        .map_db_err(DatabaseOperation::Query {
            description: format!("update metadata row {row_id}"),
        })?;

        Ok(())
    }

    async fn delete_tx(
        conn: &mut SqliteConnection,
        row_id: i64,
        testcase_name: &str,
    ) -> DatabaseResult<()> {
        sqlx::query("DELETE FROM testcase_metadata WHERE id = ?")
            .bind(row_id)
            .execute(conn)
            .await
            .map_db_err(DatabaseOperation::DeleteOverride {
                testcase: testcase_name.to_string(),
            })?;

        Ok(())
    }

    /// Record the start of a sync run, returning the log row id
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn start_sync_log(&self, release_id: Option<i64>) -> DatabaseResult<i64> {
        let mut session = self.db.write().await?;
        let row = sqlx::query(
            "
            INSERT INTO metadata_sync_log (release_id, started_at, status)
            VALUES (?, ?, 'running')
            RETURNING id
            ",
        )
        .bind(release_id)
        .bind(Utc::now())
        .fetch_one(session.conn())
        .await
        .map_db_err(DatabaseOperation::RecordSyncLog)?;

        let id: i64 = row.get("id");
        session.commit().await?;
        Ok(id)
    }

    /// Finalize a sync run log with its counters and per-file failures
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_sync_log(
        &self,
        log_id: i64,
        status: SyncStatus,
        files_scanned: i64,
        files_failed: i64,
        tests_upserted: i64,
        tests_unchanged: i64,
        error_details: &[SyncFileError],
    ) -> DatabaseResult<()> {
        let details = serde_json::to_string(error_details).unwrap_or_else(|_| "[]".to_string());

        let mut session = self.db.write().await?;
        sqlx::query(
            "
            UPDATE metadata_sync_log SET
                finished_at = ?, status = ?, files_scanned = ?, files_failed = ?,
                tests_upserted = ?, tests_unchanged = ?, error_details = ?
            WHERE id = ?
            ",
        )
        .bind(Utc::now())
        .bind(status.as_str())
        .bind(files_scanned)
        .bind(files_failed)
        .bind(tests_upserted)
        .bind(tests_unchanged)
        .bind(details)
        .bind(log_id)
        .execute(session.conn())
        .await
        .map_db_err(DatabaseOperation::RecordSyncLog)?;

        session.commit().await
    }

    /// Most recent sync runs, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_sync_logs(&self, limit: i64) -> DatabaseResult<Vec<MetadataSyncLog>> {
        let rows = sqlx::query(
            "SELECT * FROM metadata_sync_log ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Query {
            description: "recent_sync_logs".to_string(),
        })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                let details: String = row.get("error_details");
                MetadataSyncLog {
                    id: row.get("id"),
                    release_id: row.get("release_id"),
                    started_at: row.get("started_at"),
                    finished_at: row.get("finished_at"),
                    status: status.parse().unwrap_or(SyncStatus::Failed),
                    files_scanned: row.get("files_scanned"),
                    files_failed: row.get("files_failed"),
                    tests_upserted: row.get("tests_upserted"),
                    tests_unchanged: row.get("tests_unchanged"),
                    error_details: serde_json::from_str(&details).unwrap_or_default(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use crate::models::TestState;
    use crate::repository::TrackerStore;

    async fn test_store() -> (MetadataStore, TrackerStore) {
        let db = Database::connect_in_memory().await.expect("connect");
        run_migrations(&db).await.expect("migrate");
        (MetadataStore::new(db.clone()), TrackerStore::new(db))
    }

    fn content(priority: &str) -> MetadataContent {
        MetadataContent {
            test_class_name: Some("TestBgp".to_string()),
            module: Some("routing".to_string()),
            topology: Some("dual".to_string()),
            test_state: TestState::Prod,
            test_case_id: None,
            testrail_id: Some("C17".to_string()),
            priority: Some(priority.to_string()),
            test_path: Some("tests/routing/test_bgp.py".to_string()),
        }
    }

    #[tokio::test]
    async fn test_baseline_rescan_is_unchanged() {
        let (meta, _) = test_store().await;
        let db = meta.database().clone();

        let mut session = db.write().await.expect("begin");
        let outcome = MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            None,
            &content("P1"),
        )
        .await
        .expect("baseline");
        assert_eq!(outcome, UpsertOutcome::Inserted);
        session.commit().await.expect("commit");

        let mut session = db.write().await.expect("begin");
        let outcome = MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            None,
            &content("P1"),
        )
        .await
        .expect("rescan");
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        session.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn test_release_discovery_without_baseline_creates_baseline() {
        let (meta, tracker) = test_store().await;
        let release = tracker
            .ensure_release("6.1.0", None, None)
            .await
            .expect("release");
        let db = meta.database().clone();

        let mut session = db.write().await.expect("begin");
        let outcome = MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            Some(release.id),
            &content("P1"),
        )
        .await
        .expect("discover");
        assert_eq!(outcome, UpsertOutcome::Inserted);
        session.commit().await.expect("commit");

        assert!(meta
            .get("tests.routing.test_bgp", None)
            .await
            .expect("get")
            .is_some());
        assert!(meta
            .get("tests.routing.test_bgp", Some(release.id))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_override_lifecycle() {
        let (meta, tracker) = test_store().await;
        let release = tracker
            .ensure_release("6.1.0", None, None)
            .await
            .expect("release");
        let db = meta.database().clone();

        // Baseline at P1
        let mut session = db.write().await.expect("begin");
        MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            None,
            &content("P1"),
        )
        .await
        .expect("baseline");
        session.commit().await.expect("commit");

        // Release discovers P0: override appears
        let mut session = db.write().await.expect("begin");
        let outcome = MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            Some(release.id),
            &content("P0"),
        )
        .await
        .expect("override");
        assert_eq!(outcome, UpsertOutcome::Inserted);
        session.commit().await.expect("commit");

        let override_row = meta
            .get("tests.routing.test_bgp", Some(release.id))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(override_row.priority.as_deref(), Some("P0"));

        // Release converges back to the baseline: override is pruned
        let mut session = db.write().await.expect("begin");
        let outcome = MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp",
            Some(release.id),
            &content("P1"),
        )
        .await
        .expect("prune");
        assert_eq!(outcome, UpsertOutcome::OverridePruned);
        session.commit().await.expect("commit");

        assert!(meta
            .get("tests.routing.test_bgp", Some(release.id))
            .await
            .expect("get")
            .is_none());
        // Baseline survives
        assert!(meta
            .get("tests.routing.test_bgp", None)
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn test_sync_log_round_trip() {
        let (meta, _) = test_store().await;

        let log_id = meta.start_sync_log(None).await.expect("start");
        meta.finish_sync_log(
            log_id,
            SyncStatus::Completed,
            120,
            2,
            115,
            3,
            &[SyncFileError {
                path: "tests/broken/test_syntax.py".to_string(),
                reason: "syntax error at line 3".to_string(),
            }],
        )
        .await
        .expect("finish");

        let logs = meta.recent_sync_logs(10).await.expect("list");
        assert_eq!(logs.len(), 1);
        let log = logs.first().expect("log");
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.files_scanned, 120);
        assert_eq!(log.error_details.len(), 1);
    }
}
