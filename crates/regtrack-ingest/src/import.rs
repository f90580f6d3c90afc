//! Idempotent import of one (release, module, build) into the store
//!
//! The artifact streams through a blocking parser task into a bounded
//! channel of row batches; the inserter drains it inside one write
//! transaction. Memory stays proportional to the batch size, never to the
//! artifact. Any failure rolls the whole job back.

use std::collections::HashMap;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use regtrack_config::IMPORT_BATCH_SIZE;
use regtrack_junit::{ArtifactParseError, ArtifactReader};
use regtrack_storage::{NewTestResult, TrackerStore};

use crate::error::{IngestError, IngestResult};

/// Batches in flight between the parser task and the inserter
const CHANNEL_DEPTH: usize = 2;

/// Identity and context of one module build to import
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub release_name: String,
    pub module_name: String,
    /// Main-job build number
    pub parent_build: i64,
    /// The module's own CI build number
    pub module_build: i64,
    /// Version token mined from the parent's display name, when available
    pub version: Option<String>,
    /// Link back to the module build on the CI server
    pub jenkins_url: Option<String>,
}

/// Counters for one completed import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub job_db_id: i64,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub error: i64,
    /// Rows deleted from a previous import of the same build
    pub replaced: u64,
}

/// Idempotent importer of parsed artifacts
#[derive(Clone)]
pub struct ImportService {
    store: TrackerStore,
    /// Path prefix under which `testcase_module` derives from file paths
    test_root: String,
}

impl ImportService {
    /// Create an importer over the shared store
    pub const fn new(store: TrackerStore, test_root: String) -> Self {
        Self { store, test_root }
    }

    /// The underlying store
    pub const fn store(&self) -> &TrackerStore {
        &self.store
    }

    /// Whether this exact build was already imported
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn is_imported(&self, request: &ImportRequest) -> IngestResult<bool> {
        Ok(self
            .store
            .is_build_imported(
                &request.release_name,
                &request.module_name,
                &request.module_build.to_string(),
            )
            .await?)
    }

    /// Import one module build from a streaming artifact
    ///
    /// Single transaction: upsert release and module, upsert the job row
    /// (write-through on NULL fields), delete any prior results, bulk
    /// insert the parsed outcomes in batches, recompute the job counters
    /// from the inserted rows, bump the release data version, commit.
    /// Idempotent on `(release, module, module_build)`.
    ///
    /// # Errors
    ///
    /// Returns a parse error with byte offset on malformed XML, a storage
    /// error if any statement fails, or `Cancelled`; in every case the
    /// transaction is rolled back and previously committed builds are
    /// untouched.
    #[instrument(skip(self, artifact, cancel), fields(release = %request.release_name, module = %request.module_name, build = request.module_build))]
    pub async fn import_job<R>(
        &self,
        request: &ImportRequest,
        artifact: R,
        cancel: &CancellationToken,
    ) -> IngestResult<ImportReport>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        // Effective priorities are cached onto each row at import time so
        // analytics never needs a metadata join on the hot path.
        let priorities = self.store.priorities_for_release(&request.release_name).await?;

        let (batch_tx, mut batch_rx) = mpsc::channel::<ParsedBatch>(CHANNEL_DEPTH);
        let test_root = self.test_root.clone();
        let parser = tokio::task::spawn_blocking(move || {
            parse_into_batches(artifact, &test_root, &batch_tx);
        });

        let mut session = self.store.database().write().await.map_err(IngestError::Storage)?;

        let release = TrackerStore::ensure_release_tx(
            session.conn(),
            &request.release_name,
            None,
            None,
        )
        .await?;
        let module =
            TrackerStore::ensure_module_tx(session.conn(), release.id, &request.module_name)
                .await?;
        let module_build = request.module_build.to_string();
        let parent_build = request.parent_build.to_string();
        let job_db_id = TrackerStore::upsert_job_tx(
            session.conn(),
            module.id,
            &module_build,
            Some(&parent_build),
            request.jenkins_url.as_deref(),
            request.version.as_deref(),
            Some(chrono::Utc::now()),
        )
        .await?;

        let replaced = TrackerStore::delete_job_results_tx(session.conn(), job_db_id).await?;

        let mut insert_error: Option<IngestError> = None;
        while let Some(batch) = batch_rx.recv().await {
            if cancel.is_cancelled() {
                insert_error = Some(IngestError::Cancelled);
                break;
            }
            match batch {
                Ok(mut rows) => {
                    attach_priorities(&mut rows, &priorities);
                    if let Err(e) =
                        TrackerStore::insert_results_tx(session.conn(), job_db_id, &rows).await
                    {
                        insert_error = Some(IngestError::Storage(e));
                        break;
                    }
                    debug!(rows = rows.len(), "inserted batch");
                }
                Err(parse_err) => {
                    insert_error = Some(IngestError::Parse(parse_err));
                    break;
                }
            }
        }
        // Unblock the parser if we bailed early, then reap it
        drop(batch_rx);
        parser
            .await
            .map_err(|e| IngestError::Internal(format!("parser task panicked: {e}")))?;

        if let Some(error) = insert_error {
            session.rollback().await.map_err(IngestError::Storage)?;
            return Err(error);
        }

        let (total, passed, failed, skipped, error) =
            TrackerStore::recompute_job_counts_tx(session.conn(), job_db_id).await?;
        TrackerStore::bump_data_version_tx(session.conn(), release.id).await?;
        session.commit().await.map_err(IngestError::Storage)?;

        info!(total, passed, failed, skipped, error, replaced, "import committed");

        Ok(ImportReport {
            job_db_id,
            total,
            passed,
            failed,
            skipped,
            error,
            replaced,
        })
    }
}

type ParsedBatch = Result<Vec<NewTestResult>, ArtifactParseError>;

/// Blocking side of the pipeline: pull outcomes, ship bounded batches
fn parse_into_batches<R>(artifact: R, test_root: &str, batch_tx: &mpsc::Sender<ParsedBatch>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridged = std::io::BufReader::new(SyncIoBridge::new(artifact));
    let mut reader = ArtifactReader::new(bridged, test_root);
    let mut batch: Vec<NewTestResult> = Vec::with_capacity(IMPORT_BATCH_SIZE.min(1024));

    loop {
        match reader.next_outcome() {
            Ok(Some(outcome)) => {
                batch.push(outcome);
                if batch.len() >= IMPORT_BATCH_SIZE
                    && batch_tx.blocking_send(Ok(std::mem::take(&mut batch))).is_err()
                {
                    // Receiver went away (rollback path); stop parsing
                    return;
                }
            }
            Ok(None) => {
                if !batch.is_empty() {
                    let _ = batch_tx.blocking_send(Ok(batch));
                }
                return;
            }
            Err(e) => {
                let _ = batch_tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// Fill cached priorities from the effective metadata map
fn attach_priorities(rows: &mut [NewTestResult], priorities: &HashMap<String, String>) {
    for row in rows {
        if row.priority.is_none()
            && let Some(priority) = priorities.get(&row.test_name)
        {
            row.priority = Some(priority.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtrack_storage::{Database, MetadataContent, MetadataStore, TestState, TestStatus,
        run_migrations};

    fn artifact(bodies: &[(&str, &str)]) -> String {
        // (name, inner) pairs; inner empty means PASSED
        let mut xml = String::from("<testsuite>");
        for (name, inner) in bodies {
            if inner.is_empty() {
                xml.push_str(&format!(
                    r#"<testcase classname="tests.routing.test_bgp" name="{name}" file="tests/routing/test_bgp.py" time="0.5"/>"#
                ));
            } else {
                xml.push_str(&format!(
                    r#"<testcase classname="tests.routing.test_bgp" name="{name}" file="tests/routing/test_bgp.py" time="0.5">{inner}</testcase>"#
                ));
            }
        }
        xml.push_str("</testsuite>");
        xml
    }

    async fn importer() -> ImportService {
        let db = Database::connect_in_memory().await.expect("connect");
        run_migrations(&db).await.expect("migrate");
        ImportService::new(TrackerStore::new(db), "tests".to_string())
    }

    fn request(build: i64) -> ImportRequest {
        ImportRequest {
            release_name: "6.1.0".to_string(),
            module_name: "routing".to_string(),
            parent_build: 12,
            module_build: build,
            version: Some("6.1.0.17".to_string()),
            jenkins_url: None,
        }
    }

    #[tokio::test]
    async fn test_import_counts_and_watermark_side_effects() {
        let service = importer().await;
        let xml = artifact(&[
            ("test_a", ""),
            ("test_b", ""),
            ("test_c", r#"<failure message="boom">at x.py:1</failure>"#),
            ("test_d", r#"<skipped message="nope"/>"#),
        ]);

        let report = service
            .import_job(
                &request(451),
                std::io::Cursor::new(xml.into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect("import");

        assert_eq!(
            (report.total, report.passed, report.failed, report.skipped, report.error),
            (4, 2, 1, 1, 0)
        );

        let release = service
            .store()
            .get_release("6.1.0")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(release.data_version, 1);
        assert!(service.is_imported(&request(451)).await.expect("check"));
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let service = importer().await;
        let xml = artifact(&[("test_a", ""), ("test_b", r#"<failure>t</failure>"#)]);

        let first = service
            .import_job(
                &request(451),
                std::io::Cursor::new(xml.clone().into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect("first");
        let second = service
            .import_job(
                &request(451),
                std::io::Cursor::new(xml.into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect("second");

        assert_eq!(first.job_db_id, second.job_db_id);
        assert_eq!(second.replaced, 2);
        assert_eq!(
            (first.total, first.passed, first.failed),
            (second.total, second.passed, second.failed)
        );

        // Exactly one job row for the build (module id 1 in a fresh store)
        let job = service
            .store()
            .get_job(1, "451")
            .await
            .expect("job")
            .expect("exists");
        assert_eq!(job.total, 2);
    }

    #[tokio::test]
    async fn test_malformed_artifact_rolls_back() {
        let service = importer().await;

        // Valid first import to prove it survives the failed one
        let ok = artifact(&[("test_a", "")]);
        service
            .import_job(
                &request(450),
                std::io::Cursor::new(ok.into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect("seed import");

        let broken = String::from(r#"<testsuite><testcase name="x"><failure>"#);
        let err = service
            .import_job(
                &request(451),
                std::io::Cursor::new(broken.into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, IngestError::Parse(_)));

        // Build 451 left no trace; build 450 is intact
        assert!(!service.is_imported(&request(451)).await.expect("check"));
        assert!(service.is_imported(&request(450)).await.expect("check"));
    }

    #[tokio::test]
    async fn test_priorities_cached_from_metadata() {
        let service = importer().await;
        let store = MetadataStore::new(service.store().database().clone());

        let mut session = service.store().database().write().await.expect("begin");
        MetadataStore::apply_discovered_tx(
            session.conn(),
            "tests.routing.test_bgp.test_a",
            None,
            &MetadataContent {
                test_class_name: None,
                module: Some("routing".to_string()),
                topology: None,
                test_state: TestState::Prod,
                test_case_id: None,
                testrail_id: None,
                priority: Some("P0".to_string()),
                test_path: None,
            },
        )
        .await
        .expect("baseline");
        session.commit().await.expect("commit");
        drop(store);

        let xml = artifact(&[("test_a", ""), ("test_b", "")]);
        let report = service
            .import_job(
                &request(451),
                std::io::Cursor::new(xml.into_bytes()),
                &CancellationToken::new(),
            )
            .await
            .expect("import");

        assert_eq!(
            service
                .store()
                .count_results_by_status(report.job_db_id, TestStatus::Passed)
                .await
                .expect("count"),
            2
        );

        // test_a got its priority written through; test_b stayed NULL
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT test_name, priority FROM test_results WHERE job_id = ? ORDER BY test_name",
        )
        .bind(report.job_db_id)
        .fetch_all(service.store().database().read_pool())
        .await
        .expect("rows");
        assert_eq!(
            rows,
            vec![
                (
                    "tests.routing.test_bgp.test_a".to_string(),
                    Some("P0".to_string())
                ),
                ("tests.routing.test_bgp.test_b".to_string(), None),
            ]
        );
    }
}
